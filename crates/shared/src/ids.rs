use std::fmt;
use std::str::FromStr;

macro_rules! define_id {
    ($name:ident) => {
        /// Typed wrapper around UUID v7 for entity identification.
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
        )]
        pub struct $name(pub uuid::Uuid);

        #[allow(clippy::new_without_default)]
        impl $name {
            /// Generate a new time-sortable UUID v7 identifier.
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }
        }
    };
}

define_id!(UserId);
define_id!(GroupId);
define_id!(MessageId);

/// Device index of an account's primary device.
pub const PRIMARY_DEVICE: u32 = 0;

/// A single device of a user: the unit of pairwise session granularity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct DeviceAddress {
    pub user: UserId,
    pub device: u32,
}

impl DeviceAddress {
    pub fn new(user: UserId, device: u32) -> Self {
        Self { user, device }
    }

    /// The primary device (index 0) of `user`.
    pub fn primary(user: UserId) -> Self {
        Self::new(user, PRIMARY_DEVICE)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user, self.device)
    }
}

/// Error returned when a `DeviceAddress` string is malformed.
#[derive(Debug, thiserror::Error)]
#[error("invalid device address: {0}")]
pub struct ParseAddressError(pub String);

impl FromStr for DeviceAddress {
    type Err = ParseAddressError;

    /// Parses the `"<user-uuid>.<device>"` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, device) = s
            .rsplit_once('.')
            .ok_or_else(|| ParseAddressError(s.to_string()))?;
        let user = UserId::from_str(user).map_err(|_| ParseAddressError(s.to_string()))?;
        let device = device
            .parse()
            .map_err(|_| ParseAddressError(s.to_string()))?;
        Ok(Self { user, device })
    }
}

/// Any addressable entity on the network: a user (all devices), a single
/// device, or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Jid {
    User(UserId),
    Device(DeviceAddress),
    Group(GroupId),
}

impl Jid {
    pub fn is_group(&self) -> bool {
        matches!(self, Jid::Group(_))
    }

    /// The owning user for user and device identifiers.
    pub fn user(&self) -> Option<UserId> {
        match self {
            Jid::User(user) => Some(*user),
            Jid::Device(address) => Some(address.user),
            Jid::Group(_) => None,
        }
    }

    /// Strip the device part, leaving a user or group identifier.
    pub fn to_non_device(&self) -> Jid {
        match self {
            Jid::Device(address) => Jid::User(address.user),
            other => *other,
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Jid::User(user) => write!(f, "{user}"),
            Jid::Device(address) => write!(f, "{address}"),
            Jid::Group(group) => write!(f, "{group}@g"),
        }
    }
}

impl From<UserId> for Jid {
    fn from(user: UserId) -> Self {
        Jid::User(user)
    }
}

impl From<DeviceAddress> for Jid {
    fn from(address: DeviceAddress) -> Self {
        Jid::Device(address)
    }
}

impl From<GroupId> for Jid {
    fn from(group: GroupId) -> Self {
        Jid::Group(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_new_creates_valid_uuid() {
        let id = UserId::new();
        assert_eq!(id.0.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn user_id_from_str_invalid() {
        assert!(UserId::from_str("not-a-uuid").is_err());
    }

    #[test]
    fn message_id_new_is_time_sortable() {
        let a = MessageId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = MessageId::new();
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn device_address_display_parses_back() {
        let address = DeviceAddress::new(UserId::new(), 7);
        let parsed: DeviceAddress = address.to_string().parse().unwrap();
        assert_eq!(parsed, address);
    }

    #[test]
    fn device_address_rejects_missing_device() {
        let user = UserId::new();
        assert!(user.to_string().parse::<DeviceAddress>().is_err());
        assert!(format!("{user}.x").parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn device_addresses_order_by_user_then_device() {
        let user = UserId::new();
        let a = DeviceAddress::new(user, 1);
        let b = DeviceAddress::new(user, 2);
        assert!(a < b);
    }

    #[test]
    fn jid_serde_round_trip_keeps_variant() {
        let jids = [
            Jid::User(UserId::new()),
            Jid::Device(DeviceAddress::new(UserId::new(), 3)),
            Jid::Group(GroupId::new()),
        ];
        for jid in jids {
            let json = serde_json::to_string(&jid).unwrap();
            let back: Jid = serde_json::from_str(&json).unwrap();
            assert_eq!(back, jid);
        }
    }

    #[test]
    fn jid_to_non_device_strips_device() {
        let address = DeviceAddress::new(UserId::new(), 4);
        assert_eq!(Jid::Device(address).to_non_device(), Jid::User(address.user));
        assert_eq!(Jid::Device(address).user(), Some(address.user));
        assert!(Jid::Group(GroupId::new()).user().is_none());
    }
}
