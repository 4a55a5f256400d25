//! The location alert rule.
//!
//! A rule is a pure predicate over a decoded location payload plus the
//! alert it produces. It keeps no state between messages, so a redelivered
//! message that matched before matches again.

use crate::{config::AlertConfig, core::AlertEvent};
use chrono::Utc;

/// Fires when a payload's `City` and `State` fields equal the configured target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRule {
    city: String,
    state: String,
    subject_template: String,
}

impl AlertRule {
    pub fn new(city: &str, state: &str, subject_template: &str) -> Self {
        Self {
            city: city.trim().to_string(),
            state: state.trim().to_string(),
            subject_template: subject_template.to_string(),
        }
    }

    /// Builds the rule from config, or `None` when alerting is disabled.
    pub fn from_config(config: &AlertConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(&config.city, &config.state, &config.subject))
    }

    /// True when the payload's location fields exactly match the target.
    ///
    /// Payloads are upper-cased by the consumer, so both sides are compared
    /// upper-cased. Partial matches such as "Columbia Heights" do not fire.
    pub fn matches(&self, decoded: &str) -> bool {
        let city = field_value(decoded, "city");
        let state = field_value(decoded, "state");
        match (city, state) {
            (Some(city), Some(state)) => {
                city.to_uppercase() == self.city.to_uppercase()
                    && state.to_uppercase() == self.state.to_uppercase()
            }
            _ => false,
        }
    }

    /// Evaluates the rule, returning the alert to send if it fired.
    pub fn evaluate(&self, decoded: &str) -> Option<AlertEvent> {
        if !self.matches(decoded) {
            return None;
        }

        let subject = self
            .subject_template
            .replace("{city}", &self.city)
            .replace("{state}", &self.state);

        Some(AlertEvent {
            subject,
            body: format!("Brewery Information: {}", decoded),
            fired_at: Utc::now().to_rfc3339(),
        })
    }
}

/// Finds the value of a `Key: value` field in a comma-separated payload.
fn field_value<'a>(payload: &'a str, key: &str) -> Option<&'a str> {
    payload
        .split(',')
        .filter_map(|segment| segment.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim())
}
