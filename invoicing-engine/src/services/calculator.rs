//! Money and tax calculator: pure, deterministic, no I/O.
//!
//! Quantities and unit amounts carry 3 fractional digits, currency totals 2.
//! Rounding is half-away-from-zero and applied exactly once, at the point a
//! stored field is computed; derived fields are never re-rounded from
//! already-rounded inputs, so document totals reconcile to the cent with the
//! sum of the persisted line values.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use service_core::error::AppError;

use crate::models::{InvoiceKind, LineItem, LineItemInput};

/// Seller's home currency. Documents in any other currency require an
/// explicit exchange rate and never carry stamp duty.
pub const HOME_CURRENCY: &str = "TND";

/// Statutory stamp duty per qualifying home-currency document.
pub const STAMP_DUTY: Decimal = dec!(1.00);

const ONE_HUNDRED: Decimal = dec!(100);

/// Round a currency amount to its stored precision (2 digits).
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Round a quantity or unit amount to its stored precision (3 digits).
pub fn round_quantity(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(3, RoundingStrategy::MidpointAwayFromZero)
}

/// Derived monetary fields of one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputedLine {
    pub total_excl_tax: Decimal,
    pub total_tax: Decimal,
    pub total_incl_tax: Decimal,
}

/// Derived fields of a credit-note line: the negated quantity plus the
/// negated monetary share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditLine {
    pub quantity: Decimal,
    pub total_excl_tax: Decimal,
    pub total_tax: Decimal,
    pub total_incl_tax: Decimal,
}

/// Compute the three stored amounts of a line.
///
/// `excl` and `tax` are each rounded once from the full-precision
/// discounted base; `incl` is their exact sum, which keeps
/// `total_incl_tax == total_excl_tax + total_tax` an identity.
pub fn compute_line(
    quantity: Decimal,
    unit_price: Decimal,
    discount_pct: Decimal,
    vat_rate: Decimal,
) -> ComputedLine {
    let quantity = round_quantity(quantity);
    let unit_price = round_quantity(unit_price);

    let base = quantity * unit_price;
    let discounted = base * (ONE_HUNDRED - discount_pct) / ONE_HUNDRED;

    let total_excl_tax = round_money(discounted);
    let total_tax = round_money(discounted * vat_rate / ONE_HUNDRED);

    ComputedLine {
        total_excl_tax,
        total_tax,
        total_incl_tax: total_excl_tax + total_tax,
    }
}

/// Document-level totals: plain sums of the already-rounded line values, so
/// the document reconciles exactly with its persisted lines.
pub fn compute_document_totals(lines: &[ComputedLine]) -> (Decimal, Decimal) {
    lines.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(excl, tax), line| (excl + line.total_excl_tax, tax + line.total_tax),
    )
}

/// Stamp-duty policy table.
///
/// Export documents and foreign-currency documents carry no duty; local and
/// VAT-suspended documents billed in the home currency carry the fixed
/// statutory amount.
pub fn compute_stamp_duty(kind: InvoiceKind, currency: &str) -> Decimal {
    match kind {
        InvoiceKind::Export => Decimal::ZERO,
        InvoiceKind::Local | InvoiceKind::VatSuspended => {
            if currency == HOME_CURRENCY {
                STAMP_DUTY
            } else {
                Decimal::ZERO
            }
        }
    }
}

/// Force VAT to zero on export and VAT-suspended documents.
///
/// A non-zero caller-supplied rate is coerced rather than silently ignored:
/// each coercion is reported back so the caller can surface it.
pub fn apply_vat_policy(kind: InvoiceKind, lines: &mut [LineItemInput]) -> Vec<String> {
    if !kind.forces_zero_vat() {
        return Vec::new();
    }

    let mut warnings = Vec::new();
    for (index, line) in lines.iter_mut().enumerate() {
        if !line.vat_rate.is_zero() {
            warnings.push(format!(
                "line {}: VAT rate {} forced to 0 for {} invoice",
                index + 1,
                line.vat_rate,
                kind.as_str()
            ));
            line.vat_rate = Decimal::ZERO;
        }
    }
    warnings
}

/// Exact negation of a stored line (total credit note).
pub fn negate_line(line: &LineItem) -> CreditLine {
    CreditLine {
        quantity: -line.quantity,
        total_excl_tax: -line.total_excl_tax,
        total_tax: -line.total_tax,
        total_incl_tax: -line.total_incl_tax,
    }
}

/// Proportional negation of a stored line (partial credit note).
///
/// The ratio `credit_quantity / original_quantity` is applied to the
/// persisted line amounts, not recomputed from the unit price, so the
/// credit note stays consistent with what was actually invoiced. The
/// credited quantity must leave the cumulative credited total within the
/// original quantity.
pub fn prorate_line(line: &LineItem, credit_quantity: Decimal) -> Result<CreditLine, AppError> {
    if credit_quantity <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Credit quantity must be positive, got {}",
            credit_quantity
        )));
    }
    if credit_quantity > line.remaining_quantity() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Credit quantity {} exceeds remaining quantity {} on line '{}'",
            credit_quantity,
            line.remaining_quantity(),
            line.description
        )));
    }

    let ratio = credit_quantity / line.quantity;
    let total_excl_tax = round_money(line.total_excl_tax * ratio);
    let total_tax = round_money(line.total_tax * ratio);

    Ok(CreditLine {
        quantity: -round_quantity(credit_quantity),
        total_excl_tax: -total_excl_tax,
        total_tax: -total_tax,
        total_incl_tax: -(total_excl_tax + total_tax),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn stored_line(quantity: Decimal, computed: ComputedLine) -> LineItem {
        LineItem {
            line_item_id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            description: "Consulting".to_string(),
            quantity,
            unit: None,
            unit_price: Decimal::ZERO,
            discount_pct: Decimal::ZERO,
            vat_rate: Decimal::ZERO,
            total_excl_tax: computed.total_excl_tax,
            total_tax: computed.total_tax,
            total_incl_tax: computed.total_incl_tax,
            credited_quantity: Decimal::ZERO,
            sort_order: 0,
            created_utc: Utc::now(),
        }
    }

    #[test]
    fn basic_line_with_vat() {
        let line = compute_line(dec!(2), dec!(50.00), dec!(0), dec!(19));
        assert_eq!(line.total_excl_tax, dec!(100.00));
        assert_eq!(line.total_tax, dec!(19.00));
        assert_eq!(line.total_incl_tax, dec!(119.00));
    }

    #[test]
    fn discounted_line_rounds_once() {
        // 3 x 10.555 = 31.665; minus 10% = 28.4985 -> 28.50
        // tax 19% of 28.4985 = 5.414715 -> 5.41
        let line = compute_line(dec!(3), dec!(10.555), dec!(10), dec!(19));
        assert_eq!(line.total_excl_tax, dec!(28.50));
        assert_eq!(line.total_tax, dec!(5.41));
        assert_eq!(line.total_incl_tax, dec!(33.91));
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round_money(dec!(2.345)), dec!(2.35));
        assert_eq!(round_money(dec!(-2.345)), dec!(-2.35));
        assert_eq!(round_quantity(dec!(1.0005)), dec!(1.001));
    }

    #[test]
    fn stamp_duty_policy_table() {
        assert_eq!(compute_stamp_duty(InvoiceKind::Export, "TND"), dec!(0));
        assert_eq!(compute_stamp_duty(InvoiceKind::Local, "EUR"), dec!(0));
        assert_eq!(compute_stamp_duty(InvoiceKind::Local, "TND"), dec!(1.00));
        assert_eq!(
            compute_stamp_duty(InvoiceKind::VatSuspended, "TND"),
            dec!(1.00)
        );
    }

    #[test]
    fn export_vat_is_coerced_with_warning() {
        let mut lines = vec![LineItemInput {
            description: "Widget".to_string(),
            quantity: dec!(1),
            unit: None,
            unit_price: dec!(10),
            discount_pct: dec!(0),
            vat_rate: dec!(19),
        }];

        let warnings = apply_vat_policy(InvoiceKind::Export, &mut lines);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("forced to 0"));
        assert_eq!(lines[0].vat_rate, dec!(0));
    }

    #[test]
    fn local_vat_passes_through_unchanged() {
        let mut lines = vec![LineItemInput {
            description: "Widget".to_string(),
            quantity: dec!(1),
            unit: None,
            unit_price: dec!(10),
            discount_pct: dec!(0),
            vat_rate: dec!(19),
        }];

        let warnings = apply_vat_policy(InvoiceKind::Local, &mut lines);
        assert!(warnings.is_empty());
        assert_eq!(lines[0].vat_rate, dec!(19));
    }

    #[test]
    fn total_negation_is_exact() {
        let computed = compute_line(dec!(2), dec!(50.00), dec!(0), dec!(19));
        let line = stored_line(dec!(2), computed);

        let credit = negate_line(&line);
        assert_eq!(credit.quantity, dec!(-2));
        assert_eq!(credit.total_excl_tax, dec!(-100.00));
        assert_eq!(credit.total_tax, dec!(-19.00));
        assert_eq!(credit.total_incl_tax, dec!(-119.00));
    }

    #[test]
    fn partial_credit_is_proportional() {
        // 2 of 5 units of a 100.00 line credits 40.00.
        let line = stored_line(
            dec!(5),
            ComputedLine {
                total_excl_tax: dec!(100.00),
                total_tax: dec!(19.00),
                total_incl_tax: dec!(119.00),
            },
        );

        let credit = prorate_line(&line, dec!(2)).unwrap();
        assert_eq!(credit.quantity, dec!(-2));
        assert_eq!(credit.total_excl_tax, dec!(-40.00));
        assert_eq!(credit.total_tax, dec!(-7.60));
        assert_eq!(credit.total_incl_tax, dec!(-47.60));
    }

    #[test]
    fn partial_credit_rejects_out_of_bounds_quantities() {
        let line = stored_line(
            dec!(5),
            ComputedLine {
                total_excl_tax: dec!(100.00),
                total_tax: dec!(0),
                total_incl_tax: dec!(100.00),
            },
        );

        assert!(matches!(
            prorate_line(&line, dec!(0)),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            prorate_line(&line, dec!(6)),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn partial_credit_respects_cumulative_tracking() {
        let mut line = stored_line(
            dec!(5),
            ComputedLine {
                total_excl_tax: dec!(100.00),
                total_tax: dec!(0),
                total_incl_tax: dec!(100.00),
            },
        );
        line.credited_quantity = dec!(4);

        assert!(prorate_line(&line, dec!(1)).is_ok());
        assert!(matches!(
            prorate_line(&line, dec!(2)),
            Err(AppError::BadRequest(_))
        ));
    }

    proptest! {
        /// Document totals reconcile exactly with persisted line values for
        /// arbitrary line sets.
        #[test]
        fn totals_reconcile_with_line_sums(
            raw in proptest::collection::vec(
                (1i64..=500_000, 1i64..=500_000, 0i64..=10_000, 0usize..4),
                1..20,
            )
        ) {
            let vat_rates = [dec!(0), dec!(7), dec!(13), dec!(19)];
            let lines: Vec<ComputedLine> = raw
                .iter()
                .map(|(qty, price, discount, vat)| {
                    compute_line(
                        Decimal::new(*qty, 3),
                        Decimal::new(*price, 3),
                        Decimal::new(*discount, 2),
                        vat_rates[*vat],
                    )
                })
                .collect();

            for line in &lines {
                prop_assert_eq!(
                    line.total_incl_tax,
                    line.total_excl_tax + line.total_tax
                );
            }

            let (total_excl, total_tax) = compute_document_totals(&lines);
            let stamp = compute_stamp_duty(InvoiceKind::Local, HOME_CURRENCY);
            let total_incl = total_excl + total_tax + stamp;

            let line_incl_sum: Decimal =
                lines.iter().map(|l| l.total_incl_tax).sum();
            prop_assert_eq!(total_incl, line_incl_sum + stamp);
        }
    }
}
