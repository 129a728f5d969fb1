// 📈 Retention Rate Calculator - statutory settlement rate per fiscal year
//
// Settled = COMPLETED with employment date + 6 months falling in the year.
//
// Rule by facility age (S = facility start fiscal year, T = target):
//   T <  S      not applicable          0 / 0
//   T == S      first year              settled[T] / capacity
//   T == S + 1  second year             settled[T] / capacity
//               (first-year rate < 40% → reported in the 30-40% bracket)
//   T >= S + 2  standard                (settled[T-1] + settled[T-2]) / (capacity × 2)
//
// Recomputed from the full roster on every call. Nothing is cached.

use crate::client::Client;
use crate::config::FacilityConfig;
use crate::error::{FunnelError, FunnelResult};
use crate::stage::Stage;
use chrono::{Datelike, Months, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Fiscal year (April 1 - March 31) a date belongs to
pub fn fiscal_year(date: NaiveDate) -> i32 {
    if date.month() >= 4 {
        date.year()
    } else {
        date.year() - 1
    }
}

// ============================================================================
// RULES AND RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionRule {
    NotApplicable,
    FirstYear,
    SecondYear,
    SecondYearFallback,
    Standard,
}

impl RetentionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionRule::NotApplicable => "not-applicable",
            RetentionRule::FirstYear => "first-year",
            RetentionRule::SecondYear => "second-year",
            RetentionRule::SecondYearFallback => "second-year-fallback",
            RetentionRule::Standard => "standard",
        }
    }
}

/// Fixed bracket regulatory reporting uses for young facilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReportingBracket {
    /// 30% or more, below 40%
    From30To40,
}

impl ReportingBracket {
    pub fn label(&self) -> &'static str {
        match self {
            ReportingBracket::From30To40 => "30%以上40%未満",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakdownEntry {
    pub label: String,
    pub value: String,
}

impl BreakdownEntry {
    fn new(label: impl Into<String>, value: impl ToString) -> Self {
        BreakdownEntry {
            label: label.into(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FiscalYearCohort {
    pub fiscal_year: i32,
    pub numerator: u32,
    pub denominator: u32,
    /// Percentage, 0 when the denominator is 0
    pub rate: f64,
    pub rule: RetentionRule,
    /// Every sub-count that fed the numerator and denominator
    pub breakdown: Vec<BreakdownEntry>,
    /// Set when regulatory reporting ignores `rate` in favor of a bracket
    pub reporting_bracket: Option<ReportingBracket>,
}

impl FiscalYearCohort {
    fn not_applicable(fiscal_year: i32, start_year: i32) -> Self {
        FiscalYearCohort {
            fiscal_year,
            numerator: 0,
            denominator: 0,
            rate: 0.0,
            rule: RetentionRule::NotApplicable,
            breakdown: vec![BreakdownEntry::new("事業所開始年度", format!("FY{}", start_year))],
            reporting_bracket: None,
        }
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "FY{} [{}]: {}/{} = {:.1}%",
            self.fiscal_year,
            self.rule.as_str(),
            self.numerator,
            self.denominator,
            self.rate
        );

        if let Some(bracket) = self.reporting_bracket {
            line.push_str(&format!(" (reported as {})", bracket.label()));
        }

        line
    }
}

// ============================================================================
// RETENTION RATE CALCULATOR
// ============================================================================

pub struct RetentionRateCalculator {
    /// First-year rate (%) from which the second year is measured normally
    pub second_year_threshold: f64,

    /// Months after employment at which a client counts as settled
    pub settlement_months: u32,
}

impl RetentionRateCalculator {
    pub fn new() -> Self {
        RetentionRateCalculator {
            second_year_threshold: 40.0,
            settlement_months: 6,
        }
    }

    pub fn with_threshold(second_year_threshold: f64) -> Self {
        RetentionRateCalculator {
            second_year_threshold,
            ..Self::new()
        }
    }

    /// Date at which a client employed on `employment_date` counts as settled
    pub fn settlement_date(&self, employment_date: NaiveDate) -> Option<NaiveDate> {
        employment_date.checked_add_months(Months::new(self.settlement_months))
    }

    /// Settled clients per fiscal year, one pass over the roster
    pub fn settled_counts(&self, roster: &[Client]) -> BTreeMap<i32, u32> {
        let mut counts = BTreeMap::new();

        for client in roster.iter().filter(|c| c.stage == Stage::Completed) {
            let Some(settled_on) = client.employment_date.and_then(|d| self.settlement_date(d))
            else {
                continue;
            };

            *counts.entry(fiscal_year(settled_on)).or_insert(0) += 1;
        }

        counts
    }

    /// Compute the cohort for `target_year`.
    ///
    /// Fails with a configuration error when capacity or start date is
    /// missing, rather than returning a misleading zero rate.
    pub fn compute(
        &self,
        roster: &[Client],
        facility: &FacilityConfig,
        target_year: i32,
    ) -> FunnelResult<FiscalYearCohort> {
        let capacity = match facility.capacity {
            Some(0) => return Err(FunnelError::configuration("capacity must be positive")),
            Some(capacity) => capacity,
            None => return Err(FunnelError::configuration("capacity is not set")),
        };
        let start_date = facility
            .start_date
            .ok_or_else(|| FunnelError::configuration("start date is not set"))?;

        let start_year = fiscal_year(start_date);
        let settled = self.settled_counts(roster);
        let settled_in = |year: i32| settled.get(&year).copied().unwrap_or(0);

        let cohort = if target_year < start_year {
            FiscalYearCohort::not_applicable(target_year, start_year)
        } else if target_year == start_year {
            let numerator = settled_in(target_year);
            single_year(target_year, numerator, capacity, RetentionRule::FirstYear)
        } else if target_year == start_year + 1 {
            let first_year_rate = percentage(settled_in(start_year), capacity);
            let numerator = settled_in(target_year);

            if first_year_rate >= self.second_year_threshold {
                single_year(target_year, numerator, capacity, RetentionRule::SecondYear)
            } else {
                let mut cohort = single_year(
                    target_year,
                    numerator,
                    capacity,
                    RetentionRule::SecondYearFallback,
                );
                cohort.breakdown.push(BreakdownEntry::new(
                    format!("FY{} rate", start_year),
                    format!("{:.1}%", first_year_rate),
                ));
                cohort
            }
        } else {
            let prev = target_year - 1;
            let prev_prev = target_year - 2;
            let settled_prev = settled_in(prev);
            let settled_prev_prev = settled_in(prev_prev);
            let numerator = settled_prev.saturating_add(settled_prev_prev);
            let denominator = capacity
                .checked_mul(2)
                .ok_or_else(|| FunnelError::configuration("capacity is too large"))?;

            FiscalYearCohort {
                fiscal_year: target_year,
                numerator,
                denominator,
                rate: percentage(numerator, denominator),
                rule: RetentionRule::Standard,
                breakdown: vec![
                    BreakdownEntry::new(format!("FY{} settled", prev), settled_prev),
                    BreakdownEntry::new(format!("FY{} settled", prev_prev), settled_prev_prev),
                    BreakdownEntry::new("capacity × years", format!("{} × 2", capacity)),
                ],
                reporting_bracket: None,
            }
        };

        debug!(
            fiscal_year = target_year,
            rule = cohort.rule.as_str(),
            numerator = cohort.numerator,
            denominator = cohort.denominator,
            "retention rate computed"
        );

        Ok(cohort)
    }
}

impl Default for RetentionRateCalculator {
    fn default() -> Self {
        Self::new()
    }
}

fn percentage(numerator: u32, denominator: u32) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        f64::from(numerator) / f64::from(denominator) * 100.0
    }
}

fn single_year(year: i32, numerator: u32, capacity: u32, rule: RetentionRule) -> FiscalYearCohort {
    let reporting_bracket = match rule {
        RetentionRule::FirstYear | RetentionRule::SecondYearFallback => {
            Some(ReportingBracket::From30To40)
        }
        _ => None,
    };

    let mut breakdown = vec![
        BreakdownEntry::new(format!("FY{} settled", year), numerator),
        BreakdownEntry::new("capacity", capacity),
    ];
    if let Some(bracket) = reporting_bracket {
        breakdown.push(BreakdownEntry::new(
            "note",
            format!("regulatory reporting uses the {} bracket", bracket.label()),
        ));
    }

    FiscalYearCohort {
        fiscal_year: year,
        numerator,
        denominator: capacity,
        rate: percentage(numerator, capacity),
        rule,
        breakdown,
        reporting_bracket,
    }
}

// ============================================================================
// TESTS
// ============================================================================
