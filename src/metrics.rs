use crate::models::{MetricField, MetricRecord};
use serde::{Deserialize, Serialize};

impl MetricRecord {
    pub fn zeroed() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn saturating_add(&self, other: &MetricRecord) -> MetricRecord {
        MetricRecord {
            leads: self.leads.saturating_add(other.leads),
            calls: self.calls.saturating_add(other.calls),
            contacts: self.contacts.saturating_add(other.contacts),
            scheduled: self.scheduled.saturating_add(other.scheduled),
            sits: self.sits.saturating_add(other.sits),
            sales: self.sales.saturating_add(other.sales),
            ap_cents: self.ap_cents.saturating_add(other.ap_cents),
        }
    }

    /// Applies a signed delta to one field, clamping at zero. Counters never
    /// go negative; decrements below zero floor instead of erroring.
    pub fn apply_adjustment(&mut self, field: MetricField, delta: i64) {
        match field {
            MetricField::Leads => self.leads = adjust_counter(self.leads, delta),
            MetricField::Calls => self.calls = adjust_counter(self.calls, delta),
            MetricField::Contacts => self.contacts = adjust_counter(self.contacts, delta),
            MetricField::Scheduled => self.scheduled = adjust_counter(self.scheduled, delta),
            MetricField::Sits => self.sits = adjust_counter(self.sits, delta),
            MetricField::Sales => self.sales = adjust_counter(self.sales, delta),
            MetricField::Ap => self.ap_cents = self.ap_cents.saturating_add(delta).max(0),
        }
    }
}

fn adjust_counter(current: u32, delta: i64) -> u32 {
    (i64::from(current) + delta).clamp(0, i64::from(u32::MAX)) as u32
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ratio {
    pub label: String,
    pub value: String,
}

impl Ratio {
    fn new(label: &str, value: String) -> Self {
        Self {
            label: label.to_string(),
            value,
        }
    }
}

/// `numerator / denominator` as a percentage string with one decimal.
/// A zero denominator is defined as 0.0%; NaN and infinity never escape.
pub fn format_percent(numerator: u32, denominator: u32) -> String {
    if denominator == 0 {
        return "0.0%".to_string();
    }
    let value = f64::from(numerator) / f64::from(denominator) * 100.0;
    format!("{:.1}%", value)
}

/// Cents per unit, round half up. Zero denominator yields zero.
pub fn cents_per(ap_cents: i64, denominator: u32) -> i64 {
    if denominator == 0 || ap_cents <= 0 {
        return 0;
    }
    let denominator = i64::from(denominator);
    (ap_cents * 2 + denominator) / (denominator * 2)
}

pub fn format_cents(cents: i64) -> String {
    let cents = cents.max(0);
    format!("${}.{:02}", cents / 100, cents % 100)
}

pub fn format_cents_per(ap_cents: i64, denominator: u32) -> String {
    format_cents(cents_per(ap_cents, denominator))
}

/// The funnel and dollar ratios shown for one Metric Record, in display
/// order. Pure and deterministic; every division is guarded.
pub fn ratio_summary(record: &MetricRecord) -> Vec<Ratio> {
    vec![
        Ratio::new("Lead to Contact", format_percent(record.contacts, record.leads)),
        Ratio::new("Contact to Scheduled", format_percent(record.scheduled, record.contacts)),
        Ratio::new("Scheduled to Sit", format_percent(record.sits, record.scheduled)),
        Ratio::new("Close Rate", format_percent(record.sales, record.sits)),
        Ratio::new("Lead to Sale", format_percent(record.sales, record.leads)),
        Ratio::new("AP per Lead", format_cents_per(record.ap_cents, record.leads)),
        Ratio::new("AP per Sit", format_cents_per(record.ap_cents, record.sits)),
        Ratio::new("AP per Sale", format_cents_per(record.ap_cents, record.sales)),
    ]
}

#[cfg(test)]
mod tests {
    use super::{cents_per, format_cents, format_percent, ratio_summary};
    use crate::models::{MetricField, MetricRecord};

    fn sample() -> MetricRecord {
        MetricRecord {
            leads: 100,
            calls: 0,
            contacts: 40,
            scheduled: 20,
            sits: 15,
            sales: 5,
            ap_cents: 250_000,
        }
    }

    #[test]
    fn funnel_ratios_match_known_inputs() {
        let ratios = ratio_summary(&sample());
        let find = |label: &str| {
            ratios
                .iter()
                .find(|ratio| ratio.label == label)
                .expect("ratio present")
                .value
                .clone()
        };
        assert_eq!(find("Lead to Contact"), "40.0%");
        assert_eq!(find("Lead to Sale"), "5.0%");
        assert_eq!(find("AP per Lead"), "$25.00");
        assert_eq!(find("AP per Sale"), "$500.00");
    }

    #[test]
    fn zero_denominators_stay_finite() {
        let record = MetricRecord::default();
        for ratio in ratio_summary(&record) {
            assert!(ratio.value == "0.0%" || ratio.value == "$0.00", "{:?}", ratio);
        }
        assert_eq!(format_percent(5, 0), "0.0%");
        assert_eq!(cents_per(250_000, 0), 0);
    }

    #[test]
    fn cents_per_rounds_half_up() {
        assert_eq!(cents_per(100, 3), 33);
        assert_eq!(cents_per(101, 2), 51);
        assert_eq!(format_cents(2500), "$25.00");
        assert_eq!(format_cents(7), "$0.07");
    }

    #[test]
    fn adjustments_clamp_at_zero() {
        let mut record = MetricRecord::default();
        record.apply_adjustment(MetricField::Sits, -3);
        assert_eq!(record.sits, 0);
        record.apply_adjustment(MetricField::Sits, 2);
        record.apply_adjustment(MetricField::Sits, -1);
        assert_eq!(record.sits, 1);
        record.apply_adjustment(MetricField::Ap, -10);
        assert_eq!(record.ap_cents, 0);
    }

    #[test]
    fn saturating_add_is_commutative() {
        let a = sample();
        let b = MetricRecord {
            leads: 3,
            calls: 8,
            contacts: 1,
            scheduled: 0,
            sits: 2,
            sales: 1,
            ap_cents: 90_000,
        };
        assert_eq!(a.saturating_add(&b), b.saturating_add(&a));
        assert_eq!(a.saturating_add(&MetricRecord::zeroed()), a);
    }
}
