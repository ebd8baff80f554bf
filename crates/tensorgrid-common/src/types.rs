//! Common types used across Tensorgrid components

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Geographic tag attached to a provider, with city, region, and country components
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationTag {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
}

impl LocationTag {
    pub fn new(city: Option<String>, region: Option<String>, country: Option<String>) -> Self {
        Self {
            city,
            region,
            country,
        }
    }

    /// A LocationTag with all components absent
    pub fn unknown() -> Self {
        Self {
            city: None,
            region: None,
            country: None,
        }
    }
}

impl FromStr for LocationTag {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();

        let component = |idx: usize| {
            parts.get(idx).and_then(|c| {
                if c.is_empty() || *c == "Unknown" {
                    None
                } else {
                    Some(c.to_string())
                }
            })
        };

        Ok(Self {
            city: component(0),
            region: component(1),
            country: component(2),
        })
    }
}

impl fmt::Display for LocationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |c: &Option<String>| c.clone().unwrap_or_else(|| "Unknown".to_string());
        write!(
            f,
            "{}/{}/{}",
            part(&self.city),
            part(&self.region),
            part(&self.country)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_location_tag_round_trip() {
        let tag: LocationTag = "Helsinki/Uusimaa/FI".parse().unwrap();
        assert_eq!(tag.city.as_deref(), Some("Helsinki"));
        assert_eq!(tag.country.as_deref(), Some("FI"));
        assert_eq!(tag.to_string(), "Helsinki/Uusimaa/FI");
    }

    #[test]
    fn test_location_tag_unknown_components() {
        let tag: LocationTag = "Unknown//DE".parse().unwrap();
        assert_eq!(tag.city, None);
        assert_eq!(tag.region, None);
        assert_eq!(tag.country.as_deref(), Some("DE"));
    }
}
