use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// ISTAT thematic categories used by the dataflow categorizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Popolazione,
    Economia,
    Lavoro,
    Territorio,
    Istruzione,
    Salute,
    Altri,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Popolazione => "popolazione",
            Self::Economia => "economia",
            Self::Lavoro => "lavoro",
            Self::Territorio => "territorio",
            Self::Istruzione => "istruzione",
            Self::Salute => "salute",
            Self::Altri => "altri",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "popolazione" => Some(Self::Popolazione),
            "economia" => Some(Self::Economia),
            "lavoro" => Some(Self::Lavoro),
            "territorio" => Some(Self::Territorio),
            "istruzione" => Some(Self::Istruzione),
            "salute" => Some(Self::Salute),
            "altri" => Some(Self::Altri),
            _ => None,
        }
    }

    pub const ALL: [Category; 7] = [
        Self::Popolazione,
        Self::Economia,
        Self::Lavoro,
        Self::Territorio,
        Self::Istruzione,
        Self::Salute,
        Self::Altri,
    ];
}

/// A keyword rule consumed by the categorizer. `rule_id` is immutable after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorizationRule {
    pub rule_id: String,
    pub category: Category,
    pub keywords: Vec<String>,
    pub priority: i64,
    pub is_active: bool,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub rule_id: String,
    pub category: Category,
    pub keywords: Vec<String>,
    pub priority: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRuleRequest {
    pub category: Category,
    pub keywords: Vec<String>,
    pub priority: i64,
    pub is_active: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Normalize keywords to lowercase trimmed non-empty tokens. Rejects an
/// empty result and non-positive priority.
pub fn normalize_rule_input(keywords: &[String], priority: i64) -> Result<Vec<String>, ApiError> {
    if priority <= 0 {
        return Err(ApiError::validation("priority must be a positive integer"));
    }
    let normalized: Vec<String> = keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    if normalized.is_empty() {
        return Err(ApiError::validation("keywords must contain at least one non-empty token"));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_are_normalized() {
        let out =
            normalize_rule_input(&["  Popolazione ".to_string(), "".to_string()], 5).unwrap();
        assert_eq!(out, vec!["popolazione"]);
    }

    #[test]
    fn empty_keywords_rejected() {
        assert!(normalize_rule_input(&["  ".to_string()], 5).is_err());
        assert!(normalize_rule_input(&[], 5).is_err());
    }

    #[test]
    fn non_positive_priority_rejected() {
        assert!(normalize_rule_input(&["a".to_string()], 0).is_err());
        assert!(normalize_rule_input(&["a".to_string()], -1).is_err());
    }

    #[test]
    fn category_serde_uses_italian_names() {
        let v = serde_json::to_value(Category::Popolazione).unwrap();
        assert_eq!(v, "popolazione");
        let back: Category = serde_json::from_value(v).unwrap();
        assert_eq!(back, Category::Popolazione);
    }
}
