//! Payment gate.
//!
//! Pure decision over the facts the orchestrator has gathered by the time the
//! invoice is on screen. Payment proceeds only when every condition holds; an
//! unresolved amount always refuses, whatever the flags say.

use std::fmt;

use serde::Serialize;

use crate::amount::{InvoiceAmount, Money};
use crate::config::RunIntent;

/// Restriction state as seen by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Clearance {
    Clear,
    /// Restricted, but the operator allowed a forced bypass.
    Bypassed,
    Restricted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateInput {
    pub intent: RunIntent,
    pub clearance: Clearance,
    pub amount: InvoiceAmount,
    pub allow_payment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "amount", rename_all = "snake_case")]
pub enum RefusalReason {
    NotExecuteIntent,
    Restricted,
    AmountUnknown,
    AmountNonZero(Money),
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefusalReason::NotExecuteIntent => f.write_str("run was not started with execute intent"),
            RefusalReason::Restricted => f.write_str("renewal is restricted"),
            RefusalReason::AmountUnknown => {
                f.write_str("invoice amount could not be determined; refusing to pay")
            }
            RefusalReason::AmountNonZero(amount) => {
                write!(f, "invoice amount {amount} is not zero and payment was not allowed")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentDecision {
    Proceed,
    Refuse(RefusalReason),
}

impl PaymentDecision {
    pub fn proceeds(&self) -> bool {
        matches!(self, PaymentDecision::Proceed)
    }
}

pub fn evaluate(input: &GateInput) -> PaymentDecision {
    if input.intent != RunIntent::Execute {
        return PaymentDecision::Refuse(RefusalReason::NotExecuteIntent);
    }
    if input.clearance == Clearance::Restricted {
        return PaymentDecision::Refuse(RefusalReason::Restricted);
    }
    match input.amount.value() {
        None => PaymentDecision::Refuse(RefusalReason::AmountUnknown),
        Some(amount) if amount.is_zero() || input.allow_payment => PaymentDecision::Proceed,
        Some(amount) => PaymentDecision::Refuse(RefusalReason::AmountNonZero(amount)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTENTS: [RunIntent; 3] = [RunIntent::Dry, RunIntent::Preview, RunIntent::Execute];
    const CLEARANCES: [Clearance; 3] = [Clearance::Clear, Clearance::Bypassed, Clearance::Restricted];

    fn input(amount: InvoiceAmount, allow_payment: bool) -> GateInput {
        GateInput {
            intent: RunIntent::Execute,
            clearance: Clearance::Clear,
            amount,
            allow_payment,
        }
    }

    #[test]
    fn unknown_amount_never_proceeds() {
        for intent in INTENTS {
            for clearance in CLEARANCES {
                for allow_payment in [false, true] {
                    let decision = evaluate(&GateInput {
                        intent,
                        clearance,
                        amount: InvoiceAmount::unknown(),
                        allow_payment,
                    });
                    assert!(!decision.proceeds(), "{intent:?} {clearance:?} {allow_payment}");
                }
            }
        }
        assert_eq!(
            evaluate(&input(InvoiceAmount::unknown(), true)),
            PaymentDecision::Refuse(RefusalReason::AmountUnknown)
        );
    }

    #[test]
    fn zero_amount_proceeds_without_allow_payment() {
        let decision = evaluate(&input(InvoiceAmount::heuristic(Money::ZERO), false));
        assert_eq!(decision, PaymentDecision::Proceed);
    }

    #[test]
    fn non_zero_amount_needs_allow_payment() {
        let amount = InvoiceAmount::structured(Money::from_cents(2_500));
        assert_eq!(
            evaluate(&input(amount, false)),
            PaymentDecision::Refuse(RefusalReason::AmountNonZero(Money::from_cents(2_500)))
        );
        assert_eq!(evaluate(&input(amount, true)), PaymentDecision::Proceed);
    }

    #[test]
    fn only_execute_intent_pays() {
        for intent in [RunIntent::Dry, RunIntent::Preview] {
            let decision = evaluate(&GateInput {
                intent,
                ..input(InvoiceAmount::structured(Money::ZERO), true)
            });
            assert_eq!(decision, PaymentDecision::Refuse(RefusalReason::NotExecuteIntent));
        }
    }

    #[test]
    fn restriction_blocks_unless_bypassed() {
        let amount = InvoiceAmount::structured(Money::ZERO);
        let restricted = GateInput {
            clearance: Clearance::Restricted,
            ..input(amount, true)
        };
        assert_eq!(
            evaluate(&restricted),
            PaymentDecision::Refuse(RefusalReason::Restricted)
        );

        let bypassed = GateInput {
            clearance: Clearance::Bypassed,
            ..input(amount, false)
        };
        assert_eq!(evaluate(&bypassed), PaymentDecision::Proceed);
    }

    #[test]
    fn refusal_reasons_read_well() {
        let reason = RefusalReason::AmountNonZero(Money::from_cents(2_500));
        assert_eq!(
            reason.to_string(),
            "invoice amount 25.00 is not zero and payment was not allowed"
        );
    }
}
