use rust_decimal::Decimal;
use serde::Serialize;

/// Order money breakdown. `total = subtotal + shipping_fee + tax - discount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
}

/// Shipping, tax and discount hooks applied at checkout.
pub trait PricingPolicy: Send + Sync {
    fn shipping_fee(&self, subtotal: Decimal) -> Decimal;
    fn tax(&self, subtotal: Decimal) -> Decimal;
    fn discount(&self, subtotal: Decimal) -> Decimal;

    fn totals(&self, subtotal: Decimal) -> OrderTotals {
        let shipping_fee = self.shipping_fee(subtotal);
        let tax = self.tax(subtotal);
        let discount = self.discount(subtotal);
        OrderTotals {
            subtotal,
            shipping_fee,
            tax,
            discount,
            total: subtotal + shipping_fee + tax - discount,
        }
    }
}

/// Fixed amounts regardless of the cart. The default charges nothing extra.
#[derive(Debug, Clone, Default)]
pub struct FlatPricing {
    pub shipping_fee: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
}

impl PricingPolicy for FlatPricing {
    fn shipping_fee(&self, _subtotal: Decimal) -> Decimal {
        self.shipping_fee
    }

    fn tax(&self, _subtotal: Decimal) -> Decimal {
        self.tax
    }

    fn discount(&self, subtotal: Decimal) -> Decimal {
        self.discount.min(subtotal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_policy_is_identity() {
        let totals = FlatPricing::default().totals(dec!(20.00));
        assert_eq!(totals.subtotal, dec!(20.00));
        assert_eq!(totals.shipping_fee, Decimal::ZERO);
        assert_eq!(totals.tax, Decimal::ZERO);
        assert_eq!(totals.discount, Decimal::ZERO);
        assert_eq!(totals.total, dec!(20.00));
    }

    #[test]
    fn total_combines_every_component() {
        let policy = FlatPricing {
            shipping_fee: dec!(5.00),
            tax: dec!(1.50),
            discount: dec!(2.00),
        };
        let totals = policy.totals(dec!(30.00));
        assert_eq!(totals.total, dec!(34.50));
    }

    #[test]
    fn discount_never_exceeds_subtotal() {
        let policy = FlatPricing {
            discount: dec!(50),
            ..Default::default()
        };
        assert_eq!(policy.totals(dec!(10)).total, Decimal::ZERO);
    }
}
