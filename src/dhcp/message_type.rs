//! DHCP message-type values and the option codes the engine actually
//! consumes or emits (spec.md §6). Unlike the teacher's exhaustive ~70
//! variant option enum, this crate treats most options as opaque bytes
//! keyed by code and only names the ones the pool/endpoint logic inspects.

/// DHCP option codes implemented by this engine (RFC 2132).
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DOMAIN_NAME: u8 = 15;
pub const OPT_BROADCAST: u8 = 28;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_NAME_SERVERS: u8 = 6;
pub const OPT_HOSTNAME: u8 = 12;

pub const OPT_PAD: u8 = 0;
pub const OPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
}

impl MessageType {
    pub fn from_u8(n: u8) -> Option<Self> {
        use MessageType::*;
        match n {
            1 => Some(Discover),
            2 => Some(Offer),
            3 => Some(Request),
            4 => Some(Decline),
            5 => Some(Ack),
            6 => Some(Nak),
            7 => Some(Release),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        use MessageType::*;
        match self {
            Discover => 1,
            Offer => 2,
            Request => 3,
            Decline => 4,
            Ack => 5,
            Nak => 6,
            Release => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_values() {
        for n in 1u8..=7 {
            let mt = MessageType::from_u8(n).unwrap();
            assert_eq!(mt.to_u8(), n);
        }
    }

    #[test]
    fn unknown_value_is_none() {
        assert!(MessageType::from_u8(42).is_none());
    }
}
