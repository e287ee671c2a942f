//! Subscription channels and the role-based access matrix.

use std::collections::HashSet;

use super::auth::{Claims, Role};

/// Logical channel a client may subscribe to. Distinct from the upstream
/// bus topics; fan-out maps each topic message onto one or more channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Tariffs,
    Alerts,
    AlertStatusUpdates,
    Region(String),
    Meter(String),
}

impl Channel {
    /// Parse a client-supplied channel name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "tariffs" => Some(Self::Tariffs),
            "alerts" => Some(Self::Alerts),
            "alert_status_updates" => Some(Self::AlertStatusUpdates),
            other => {
                if let Some(region) = other.strip_prefix("region:") {
                    (!region.is_empty()).then(|| Self::Region(region.to_string()))
                } else if let Some(meter) = other.strip_prefix("meter:") {
                    (!meter.is_empty()).then(|| Self::Meter(meter.to_string()))
                } else {
                    None
                }
            }
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Tariffs => "tariffs".to_string(),
            Self::Alerts => "alerts".to_string(),
            Self::AlertStatusUpdates => "alert_status_updates".to_string(),
            Self::Region(region) => format!("region:{region}"),
            Self::Meter(meter) => format!("meter:{meter}"),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Channels a fresh connection is subscribed to, by role and claims.
pub fn default_channels(claims: &Claims) -> HashSet<Channel> {
    let mut channels = HashSet::new();
    channels.insert(Channel::Tariffs);
    if matches!(claims.role, Role::Operator | Role::Admin) {
        channels.insert(Channel::Alerts);
        channels.insert(Channel::AlertStatusUpdates);
    }
    if let Some(region) = &claims.region {
        channels.insert(Channel::Region(region.clone()));
    }
    if let Some(meter) = &claims.meter_id {
        channels.insert(Channel::Meter(meter.clone()));
    }
    channels
}

/// Access matrix: may `claims` subscribe to `channel`?
pub fn can_subscribe(claims: &Claims, channel: &Channel) -> bool {
    match channel {
        Channel::Tariffs => true,
        Channel::Alerts | Channel::AlertStatusUpdates => {
            matches!(claims.role, Role::Operator | Role::Admin)
        }
        Channel::Region(region) => match claims.role {
            Role::Operator | Role::Admin => true,
            Role::User => claims.region.as_deref() == Some(region.as_str()),
        },
        Channel::Meter(meter) => match claims.role {
            Role::Operator | Role::Admin => true,
            Role::User => claims.meter_id.as_deref() == Some(meter.as_str()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(role: Role, region: Option<&str>, meter: Option<&str>) -> Claims {
        Claims {
            sub: "u".to_string(),
            role,
            region: region.map(String::from),
            meter_id: meter.map(String::from),
            exp: 0,
        }
    }

    #[test]
    fn parse_round_trips() {
        for name in ["tariffs", "alerts", "alert_status_updates", "region:Pune-West", "meter:MTR-1"] {
            assert_eq!(Channel::parse(name).unwrap().name(), name);
        }
        assert!(Channel::parse("region:").is_none());
        assert!(Channel::parse("billing").is_none());
    }

    #[test]
    fn operator_defaults_include_alert_channels() {
        let defaults = default_channels(&claims(Role::Operator, Some("Pune-West"), None));
        assert!(defaults.contains(&Channel::Tariffs));
        assert!(defaults.contains(&Channel::Alerts));
        assert!(defaults.contains(&Channel::AlertStatusUpdates));
        assert!(defaults.contains(&Channel::Region("Pune-West".to_string())));
    }

    #[test]
    fn user_defaults_are_tariffs_plus_own_scope() {
        let defaults = default_channels(&claims(Role::User, None, Some("MTR-1")));
        assert_eq!(defaults.len(), 2);
        assert!(defaults.contains(&Channel::Tariffs));
        assert!(defaults.contains(&Channel::Meter("MTR-1".to_string())));
    }

    #[test]
    fn users_cannot_subscribe_to_alerts() {
        let user = claims(Role::User, Some("Pune-West"), None);
        assert!(!can_subscribe(&user, &Channel::Alerts));
        assert!(!can_subscribe(&user, &Channel::AlertStatusUpdates));
        assert!(can_subscribe(&user, &Channel::Tariffs));
    }

    #[test]
    fn users_are_scoped_to_their_own_region_and_meter() {
        let user = claims(Role::User, Some("Pune-West"), Some("MTR-1"));
        assert!(can_subscribe(&user, &Channel::Region("Pune-West".to_string())));
        assert!(!can_subscribe(&user, &Channel::Region("Mumbai-North".to_string())));
        assert!(can_subscribe(&user, &Channel::Meter("MTR-1".to_string())));
        assert!(!can_subscribe(&user, &Channel::Meter("MTR-2".to_string())));
    }

    #[test]
    fn operators_and_admins_roam_freely() {
        for role in [Role::Operator, Role::Admin] {
            let c = claims(role, None, None);
            assert!(can_subscribe(&c, &Channel::Region("Anywhere".to_string())));
            assert!(can_subscribe(&c, &Channel::Meter("MTR-99".to_string())));
        }
    }
}
