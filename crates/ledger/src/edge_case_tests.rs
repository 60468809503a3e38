// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Credit Ledger
//!
//! Tests critical boundary conditions in:
//! - Transaction chain verification
//! - Campaign distribution math
//! - Expiry clawback clamping
//! - Subscription state transitions
//! - Webhook event normalization

#[cfg(test)]
mod chain_tests {
    use crate::credits::{chain_violations, CreditTransaction};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn tx(amount: Decimal, previous: Decimal, new: Decimal) -> CreditTransaction {
        CreditTransaction {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            entity_id: Uuid::new_v4(),
            transaction_type: "purchase".to_string(),
            amount,
            previous_balance: previous,
            new_balance: new,
            operation_code: "edge".to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    // =========================================================================
    // A single transaction with correct arithmetic is a valid chain
    // =========================================================================
    #[test]
    fn single_valid_transaction() {
        assert!(chain_violations(&[tx(dec!(100), dec!(0), dec!(100))]).is_empty());
    }

    // =========================================================================
    // A zero-amount delta is legal and keeps the chain intact
    // =========================================================================
    #[test]
    fn zero_amount_delta_keeps_chain() {
        let txs = vec![
            tx(dec!(100), dec!(0), dec!(100)),
            tx(dec!(0), dec!(100), dec!(100)),
            tx(dec!(-40), dec!(100), dec!(60)),
        ];
        assert!(chain_violations(&txs).is_empty());
    }

    // =========================================================================
    // Fractional credit amounts must chain exactly, no float drift
    // =========================================================================
    #[test]
    fn fractional_amounts_chain_exactly() {
        let txs = vec![
            tx(dec!(0.10), dec!(0), dec!(0.10)),
            tx(dec!(0.20), dec!(0.10), dec!(0.30)),
            tx(dec!(-0.30), dec!(0.30), dec!(0.00)),
        ];
        assert!(chain_violations(&txs).is_empty());
    }

    // =========================================================================
    // One corrupted entry produces both an arithmetic break on itself
    // and a continuity break on its successor
    // =========================================================================
    #[test]
    fn corruption_is_flagged_twice() {
        let txs = vec![
            tx(dec!(100), dec!(0), dec!(100)),
            tx(dec!(50), dec!(100), dec!(200)), // arithmetic break
            tx(dec!(10), dec!(200), dec!(210)), // continuity fine vs claimed 200
        ];
        let violations = chain_violations(&txs);
        assert_eq!(violations.len(), 1);

        let txs = vec![
            tx(dec!(100), dec!(0), dec!(100)),
            tx(dec!(50), dec!(90), dec!(140)), // continuity break (90 != 100)
        ];
        let violations = chain_violations(&txs);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].description.contains("continuity"));
    }
}

#[cfg(test)]
mod campaign_tests {
    use crate::campaigns::{clawback_amount, split_across_applications, tenant_share};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    // =========================================================================
    // Equal distribution of 1000 across 4 tenants grants 250 each
    // =========================================================================
    #[test]
    fn equal_split_four_tenants() {
        assert_eq!(tenant_share(None, "equal", dec!(1000), 4), dec!(250));
    }

    // =========================================================================
    // Equal distribution with a single tenant grants the whole pool
    // =========================================================================
    #[test]
    fn equal_split_single_tenant() {
        assert_eq!(tenant_share(None, "equal", dec!(1000), 1), dec!(1000));
    }

    // =========================================================================
    // Zero targets must not divide by zero
    // =========================================================================
    #[test]
    fn equal_split_zero_tenants_falls_back_to_total() {
        assert_eq!(tenant_share(None, "equal", dec!(1000), 0), dec!(1000));
    }

    // =========================================================================
    // Application split: one application receives the full grant
    // =========================================================================
    #[test]
    fn single_application_gets_full_grant() {
        let apps = vec!["reports".to_string()];
        let rows = split_across_applications(dec!(250), &apps);
        assert_eq!(rows, vec![("reports".to_string(), dec!(250))]);
    }

    // =========================================================================
    // Application split over 7 apps: rows still sum to the exact grant
    // =========================================================================
    #[test]
    fn seven_way_split_sums_exactly() {
        let apps: Vec<String> = (0..7).map(|i| format!("app{}", i)).collect();
        let rows = split_across_applications(dec!(100), &apps);
        let total: Decimal = rows.iter().map(|(_, p)| *p).sum();
        assert_eq!(total, dec!(100));
    }

    // =========================================================================
    // Clawback when the balance was partly consumed elsewhere: debit
    // stops at the remaining balance, never below zero
    // =========================================================================
    #[test]
    fn clawback_never_overdraws() {
        // unused 380, balance only 300
        assert_eq!(clawback_amount(dec!(500), dec!(120), dec!(300)), dec!(300));
        // balance already zero
        assert_eq!(clawback_amount(dec!(500), dec!(120), dec!(0)), dec!(0));
    }

    // =========================================================================
    // Over-consumed allocation (used > allocated) has nothing to claw back
    // =========================================================================
    #[test]
    fn over_consumed_allocation_debits_nothing() {
        assert_eq!(clawback_amount(dec!(200), dec!(250), dec!(500)), dec!(0));
    }
}

#[cfg(test)]
mod subscription_tests {
    use crate::subscriptions::SubscriptionStatus;

    // =========================================================================
    // Full transition matrix: only the documented edges are legal
    // =========================================================================
    #[test]
    fn transition_matrix() {
        use SubscriptionStatus::*;
        let legal = [
            (Trial, Active),
            (Trial, Canceled),
            (Active, PastDue),
            (Active, Canceled),
            (PastDue, Active),
            (PastDue, Canceled),
        ];

        for from in [Trial, Active, PastDue, Canceled] {
            for to in [Trial, Active, PastDue, Canceled] {
                let expected = from == to || legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition(to),
                    expected,
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    // =========================================================================
    // Canceled is terminal except for replayed cancellations
    // =========================================================================
    #[test]
    fn canceled_is_terminal() {
        use SubscriptionStatus::*;
        assert!(Canceled.can_transition(Canceled));
        assert!(!Canceled.can_transition(Active));
        assert!(!Canceled.can_transition(Trial));
        assert!(!Canceled.can_transition(PastDue));
    }

    // =========================================================================
    // Gateway status strings map onto the local lifecycle
    // =========================================================================
    #[test]
    fn gateway_status_mapping() {
        use SubscriptionStatus::*;
        assert_eq!(SubscriptionStatus::from_gateway("trialing"), Some(Trial));
        assert_eq!(SubscriptionStatus::from_gateway("active"), Some(Active));
        assert_eq!(SubscriptionStatus::from_gateway("past_due"), Some(PastDue));
        assert_eq!(SubscriptionStatus::from_gateway("unpaid"), Some(PastDue));
        assert_eq!(SubscriptionStatus::from_gateway("canceled"), Some(Canceled));
        assert_eq!(
            SubscriptionStatus::from_gateway("incomplete_expired"),
            Some(Canceled)
        );
        assert_eq!(SubscriptionStatus::from_gateway("paused"), None);
    }
}

#[cfg(test)]
mod normalization_tests {
    use crate::gateway::{normalize, GatewayEvent};

    // =========================================================================
    // Malformed JSON body is rejected outright
    // =========================================================================
    #[test]
    fn malformed_body_is_rejected() {
        assert!(normalize("{not json").is_err());
        assert!(normalize("").is_err());
    }

    // =========================================================================
    // A known event type with a malformed object is an error, not an
    // Unhandled fallthrough
    // =========================================================================
    #[test]
    fn known_type_with_bad_object_errors() {
        let payload = serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": 1_700_000_000,
            "data": { "object": { "unexpected": true } }
        })
        .to_string();

        assert!(normalize(&payload).is_err());
    }

    // =========================================================================
    // Metadata-free checkout sessions still decode (metadata defaults)
    // =========================================================================
    #[test]
    fn checkout_without_metadata_decodes() {
        let payload = serde_json::json!({
            "id": "evt_2",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "cs_1",
                "customer": "cus_9",
                "subscription": null,
                "amount_total": "25.00",
                "currency": "usd"
            }}
        })
        .to_string();

        let normalized = normalize(&payload).unwrap();
        match normalized.event {
            GatewayEvent::CheckoutCompleted(session) => {
                assert!(session.metadata.is_empty());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }
}
