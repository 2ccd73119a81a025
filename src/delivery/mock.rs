use crate::delivery::dns::MxCandidate;

/// Test stand-in for the DNS resolver: a fixed MX set, an optional implicit
/// MX, and one TXT record.
#[derive(Clone, Default)]
pub struct Resolver {
    pub mx: Vec<MxCandidate>,
    pub implicit: bool,
    pub txt: String,
    pub fail: bool,
}

pub fn mx(preference: u16, hostname: &str, port: u16) -> MxCandidate {
    MxCandidate {
        hostname: hostname.to_string(),
        port,
        preference,
    }
}

impl Resolver {
    /// Points every lookup at a local test server, the way delivery tests
    /// run against mailcrab.
    pub fn local(port: u16) -> Self {
        Self {
            mx: vec![mx(10, "localhost", port)],
            ..Default::default()
        }
    }
}
