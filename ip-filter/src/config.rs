use std::{fmt, time::Duration};

use anyhow::{Result, anyhow, ensure};
use ip_filter_common::{POLICY_ALLOW, POLICY_DENY};

pub const DEFAULT_UPDATE_PERIOD_SECS: u64 = 60 * 60;
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterMode {
    /// Listed prefixes are marked as explicitly allowed.
    Allow,
    /// Listed prefixes are dropped.
    Deny,
}

impl FilterMode {
    pub fn from_flags(allow: bool, deny: bool) -> Result<Self> {
        match (allow, deny) {
            (true, true) => Err(anyhow!("cannot use both --allow and --deny modes")),
            (false, false) => Err(anyhow!("must specify either --allow or --deny mode")),
            (true, false) => Ok(FilterMode::Allow),
            (false, true) => Ok(FilterMode::Deny),
        }
    }

    pub fn policy(self) -> u8 {
        match self {
            FilterMode::Allow => POLICY_ALLOW,
            FilterMode::Deny => POLICY_DENY,
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterMode::Allow => f.write_str("allow"),
            FilterMode::Deny => f.write_str("deny"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FilterConfig {
    pub mode: FilterMode,
    pub countries: Vec<String>,
    pub update_period: Duration,
    pub report_interval: Duration,
}

impl FilterConfig {
    pub fn new(
        mode: FilterMode,
        countries: &str,
        update_period: Duration,
        report_interval: Duration,
    ) -> Result<Self> {
        let countries = parse_countries(countries)?;
        ensure!(
            !update_period.is_zero(),
            "update period must be greater than zero"
        );
        ensure!(
            !report_interval.is_zero(),
            "report interval must be greater than zero"
        );
        Ok(Self {
            mode,
            countries,
            update_period,
            report_interval,
        })
    }
}

/// Split a comma-separated list of country codes, lowercased and
/// deduplicated in input order.
pub fn parse_countries(raw: &str) -> Result<Vec<String>> {
    let mut countries: Vec<String> = Vec::new();
    for part in raw.split(',') {
        let code = part.trim().to_ascii_lowercase();
        if code.is_empty() {
            continue;
        }
        ensure!(
            code.chars().all(|c| c.is_ascii_alphabetic()),
            "invalid country code '{}'",
            part.trim()
        );
        if !countries.contains(&code) {
            countries.push(code);
        }
    }
    ensure!(!countries.is_empty(), "must specify countries");
    Ok(countries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_flags_are_exclusive() {
        assert!(FilterMode::from_flags(true, true).is_err());
        assert!(FilterMode::from_flags(false, false).is_err());
        assert_eq!(FilterMode::from_flags(true, false).unwrap(), FilterMode::Allow);
        assert_eq!(FilterMode::from_flags(false, true).unwrap(), FilterMode::Deny);
    }

    #[test]
    fn mode_policy_bytes() {
        assert_eq!(FilterMode::Deny.policy(), 0);
        assert_eq!(FilterMode::Allow.policy(), 1);
    }

    #[test]
    fn countries_are_normalised() {
        assert_eq!(
            parse_countries(" RU, cn ,,ru").unwrap(),
            vec!["ru".to_string(), "cn".to_string()]
        );
    }

    #[test]
    fn countries_reject_empty_and_odd_input() {
        assert!(parse_countries("").is_err());
        assert!(parse_countries(" , ").is_err());
        assert!(parse_countries("us/../x").is_err());
    }

    #[test]
    fn config_rejects_zero_periods() {
        let hour = Duration::from_secs(DEFAULT_UPDATE_PERIOD_SECS);
        assert!(FilterConfig::new(FilterMode::Deny, "de", Duration::ZERO, hour).is_err());
        assert!(FilterConfig::new(FilterMode::Deny, "de", hour, Duration::ZERO).is_err());
        let cfg = FilterConfig::new(FilterMode::Deny, "de", hour, hour).unwrap();
        assert_eq!(cfg.countries, vec!["de".to_string()]);
    }
}
