use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// What-if slider inputs. Rates are percentages in 0..=100; the average
/// sale AP comes from historical data (cents).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionInputs {
    pub leads: u32,
    pub contact_rate: f64,
    pub scheduled_rate: f64,
    pub sit_rate: f64,
    pub close_rate: f64,
    pub avg_sale_ap_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub contacts: u32,
    pub scheduled: u32,
    pub sits: u32,
    pub sales: u32,
    pub projected_ap_cents: i64,
}

/// Sequential funnel projection: each stage applies its rate to the
/// previous stage's rounded count (round half up), so the numbers shown
/// are whole prospects at every step.
pub fn project(inputs: &ProjectionInputs) -> AppResult<Projection> {
    for (name, rate) in [
        ("contactRate", inputs.contact_rate),
        ("scheduledRate", inputs.scheduled_rate),
        ("sitRate", inputs.sit_rate),
        ("closeRate", inputs.close_rate),
    ] {
        if !rate.is_finite() || !(0.0..=100.0).contains(&rate) {
            return Err(AppError::Validation(format!(
                "{} must be a percentage between 0 and 100 (got {})",
                name, rate
            )));
        }
    }
    if inputs.avg_sale_ap_cents < 0 {
        return Err(AppError::Validation(
            "averageSaleAp cannot be negative".to_string(),
        ));
    }

    let contacts = apply_rate(inputs.leads, inputs.contact_rate);
    let scheduled = apply_rate(contacts, inputs.scheduled_rate);
    let sits = apply_rate(scheduled, inputs.sit_rate);
    let sales = apply_rate(sits, inputs.close_rate);

    Ok(Projection {
        contacts,
        scheduled,
        sits,
        sales,
        projected_ap_cents: inputs.avg_sale_ap_cents.saturating_mul(i64::from(sales)),
    })
}

fn apply_rate(count: u32, rate_percent: f64) -> u32 {
    let value = f64::from(count) * rate_percent / 100.0;
    (value + 0.5).floor() as u32
}

#[cfg(test)]
mod tests {
    use super::{project, ProjectionInputs};

    #[test]
    fn projects_the_reference_funnel() {
        let projection = project(&ProjectionInputs {
            leads: 50,
            contact_rate: 30.0,
            scheduled_rate: 40.0,
            sit_rate: 60.0,
            close_rate: 50.0,
            avg_sale_ap_cents: 250_000,
        })
        .expect("projection");

        assert_eq!(projection.contacts, 15);
        assert_eq!(projection.scheduled, 6);
        assert_eq!(projection.sits, 4);
        assert_eq!(projection.sales, 2);
        assert_eq!(projection.projected_ap_cents, 500_000);
    }

    #[test]
    fn zero_leads_projects_zero_everything() {
        let projection = project(&ProjectionInputs {
            leads: 0,
            contact_rate: 100.0,
            scheduled_rate: 100.0,
            sit_rate: 100.0,
            close_rate: 100.0,
            avg_sale_ap_cents: 100_000,
        })
        .expect("projection");
        assert_eq!(projection.sales, 0);
        assert_eq!(projection.projected_ap_cents, 0);
    }

    #[test]
    fn out_of_range_rate_is_rejected() {
        let err = project(&ProjectionInputs {
            leads: 10,
            contact_rate: 130.0,
            scheduled_rate: 40.0,
            sit_rate: 60.0,
            close_rate: 50.0,
            avg_sale_ap_cents: 0,
        })
        .expect_err("rate above 100 should fail");
        assert!(err.to_string().contains("contactRate"));
    }
}
