// profile.rs -- version-parameterized protocol dispatch table
//
// Pure data: given a negotiated server version quad, resolve message codes,
// payload lengths, and preconstructed bodies for the handful of control
// messages this core sends and receives. No sockets, no state.

use std::fmt;

/// Four-part server version, as reported during RTSP/handshake negotiation
/// (out of scope here; this core only consumes the already-parsed quad).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionQuad {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub build: u16,
}

impl VersionQuad {
    pub const fn new(major: u16, minor: u16, patch: u16, build: u16) -> Self {
        Self { major, minor, patch, build }
    }

    /// True if this version is at or above `major.minor.patch` (build ignored).
    pub fn at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }
}

impl fmt::Display for VersionQuad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.patch, self.build)
    }
}

/// The five known protocol generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileKind {
    Gen3,
    Gen4,
    Gen5,
    Gen7,
    Gen7Encrypted,
}

/// Index into a profile's per-message tables: the fixed set of control/input
/// message kinds every profile resolves codes and lengths for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageIndex {
    StartA,
    StartB,
    InvalidateRefFrames,
    LossStats,
    FrameStats,
    InputData,
    RumbleData,
    Termination,
}

const ALL_INDICES: [MessageIndex; 8] = [
    MessageIndex::StartA,
    MessageIndex::StartB,
    MessageIndex::InvalidateRefFrames,
    MessageIndex::LossStats,
    MessageIndex::FrameStats,
    MessageIndex::InputData,
    MessageIndex::RumbleData,
    MessageIndex::Termination,
];

/// A message code/length entry. `None` means the index is unused by this
/// profile; such indices must never be sent.
#[derive(Debug, Clone, Copy)]
struct Entry {
    code: Option<u16>,
    len: Option<u16>,
}

const ABSENT: Entry = Entry { code: None, len: None };

/// Behavior flags derived from the negotiated version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileFlags {
    pub uses_enet: bool,
    pub encrypted_control_stream: bool,
    pub use_periodic_ping: bool,
    pub input_on_control_stream: bool,
    pub input_gcm_mode: bool,
    pub rolling_iv_quirk: bool,
}

/// Immutable, selected once at session start from the server's version quad.
#[derive(Debug, Clone, Copy)]
pub struct Profile {
    pub kind: ProfileKind,
    pub flags: ProfileFlags,
    entries: [Entry; 8],
}

// Preconstructed constant payload bodies. Content is placeholder-but-stable:
// callers only depend on these being fixed-size and fixed-content across a
// session.
const START_A_BODY: [u8; 4] = [0x00, 0x00, 0x00, 0x00];
const START_B_BODY: [u8; 4] = [0x00, 0x00, 0x00, 0x00];
const REQUEST_IDR_LEGACY_BODY: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

impl Profile {
    fn idx(i: MessageIndex) -> usize {
        ALL_INDICES.iter().position(|x| *x == i).unwrap()
    }

    pub fn code(&self, i: MessageIndex) -> Option<u16> {
        self.entries[Self::idx(i)].code
    }

    pub fn payload_len(&self, i: MessageIndex) -> Option<u16> {
        self.entries[Self::idx(i)].len
    }

    /// Preconstructed constant body for indices that have one. Only StartA,
    /// StartB, and (on profiles below Gen5) the legacy IDR request carry one.
    pub fn preconstructed(&self, i: MessageIndex) -> Option<&'static [u8]> {
        match i {
            MessageIndex::StartA => Some(&START_A_BODY),
            MessageIndex::StartB => Some(&START_B_BODY),
            MessageIndex::InvalidateRefFrames if !self.flags.uses_enet => {
                Some(&REQUEST_IDR_LEGACY_BODY)
            }
            _ => None,
        }
    }
}

// Wire message codes, shared across generations (grounded in the control
// message numbering used by the wider GameStream-server ecosystem).
mod codes {
    pub const START_A: u16 = 0x0305;
    pub const START_B: u16 = 0x0307;
    pub const INVALIDATE_REF_FRAMES: u16 = 0x0301;
    pub const REQUEST_IDR_FRAME: u16 = 0x0302;
    pub const LOSS_STATS: u16 = 0x0201;
    pub const FRAME_STATS: u16 = 0x0204;
    pub const INPUT_DATA: u16 = 0x0206;
    pub const RUMBLE_DATA: u16 = 0x010b;
    pub const TERMINATION: u16 = 0x0100;
}

fn build_entries(kind: ProfileKind) -> [Entry; 8] {
    use MessageIndex::*;
    let uses_enet = matches!(kind, ProfileKind::Gen5 | ProfileKind::Gen7 | ProfileKind::Gen7Encrypted);

    let mut table = [ABSENT; 8];
    table[Profile::idx(StartA)] = Entry { code: Some(codes::START_A), len: Some(4) };
    table[Profile::idx(StartB)] = Entry { code: Some(codes::START_B), len: Some(4) };
    table[Profile::idx(InvalidateRefFrames)] = if uses_enet {
        Entry { code: Some(codes::INVALIDATE_REF_FRAMES), len: Some(24) }
    } else {
        Entry { code: Some(codes::REQUEST_IDR_FRAME), len: Some(4) }
    };
    table[Profile::idx(LossStats)] = Entry { code: Some(codes::LOSS_STATS), len: Some(32) };
    table[Profile::idx(FrameStats)] = Entry { code: Some(codes::FRAME_STATS), len: Some(64) };
    table[Profile::idx(InputData)] = Entry { code: Some(codes::INPUT_DATA), len: None };
    table[Profile::idx(RumbleData)] = Entry { code: Some(codes::RUMBLE_DATA), len: None };
    table[Profile::idx(Termination)] = Entry { code: Some(codes::TERMINATION), len: None };
    table
}

/// Resolve the protocol profile for a negotiated server version.
pub fn profile_for(version: VersionQuad) -> Profile {
    let kind = if version.at_least(7, 1, 431) {
        ProfileKind::Gen7Encrypted
    } else if version.major >= 7 {
        ProfileKind::Gen7
    } else if version.major >= 5 {
        ProfileKind::Gen5
    } else if version.major == 4 {
        ProfileKind::Gen4
    } else {
        ProfileKind::Gen3
    };

    let uses_enet = matches!(kind, ProfileKind::Gen5 | ProfileKind::Gen7 | ProfileKind::Gen7Encrypted);
    let flags = ProfileFlags {
        uses_enet,
        encrypted_control_stream: matches!(kind, ProfileKind::Gen7Encrypted),
        use_periodic_ping: version.at_least(7, 1, 415),
        input_on_control_stream: uses_enet,
        input_gcm_mode: matches!(kind, ProfileKind::Gen7 | ProfileKind::Gen7Encrypted),
        rolling_iv_quirk: matches!(kind, ProfileKind::Gen7 | ProfileKind::Gen7Encrypted),
    };

    Profile { kind, flags, entries: build_entries(kind) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen3_has_no_enet() {
        let p = profile_for(VersionQuad::new(3, 0, 0, 0));
        assert!(!p.flags.uses_enet);
        assert!(!p.flags.input_on_control_stream);
        assert!(!p.flags.input_gcm_mode);
    }

    #[test]
    fn gen5_uses_enet_but_not_gcm_input() {
        let p = profile_for(VersionQuad::new(5, 0, 0, 0));
        assert!(p.flags.uses_enet);
        assert!(p.flags.input_on_control_stream);
        assert!(!p.flags.input_gcm_mode);
        assert!(!p.flags.encrypted_control_stream);
    }

    #[test]
    fn gen7_below_encryption_threshold_is_plaintext_control() {
        let p = profile_for(VersionQuad::new(7, 1, 400, 0));
        assert_eq!(p.kind, ProfileKind::Gen7);
        assert!(p.flags.input_gcm_mode);
        assert!(!p.flags.encrypted_control_stream);
        assert!(p.flags.use_periodic_ping);
    }

    #[test]
    fn gen7_encrypted_at_or_above_threshold() {
        let p = profile_for(VersionQuad::new(7, 1, 431, 0));
        assert_eq!(p.kind, ProfileKind::Gen7Encrypted);
        assert!(p.flags.encrypted_control_stream);
        assert!(p.flags.rolling_iv_quirk);
    }

    #[test]
    fn unused_indices_return_none() {
        // Below Gen5, InvalidateRefFrames index resolves to the legacy
        // RequestIdrFrame code instead, never the ENet-era code.
        let p = profile_for(VersionQuad::new(3, 0, 0, 0));
        assert_eq!(p.code(MessageIndex::InvalidateRefFrames), Some(codes::REQUEST_IDR_FRAME));
        assert_ne!(p.code(MessageIndex::InvalidateRefFrames), Some(codes::INVALIDATE_REF_FRAMES));
    }

    #[test]
    fn preconstructed_start_bodies_present_on_every_profile() {
        for kind_version in [
            VersionQuad::new(3, 0, 0, 0),
            VersionQuad::new(4, 0, 0, 0),
            VersionQuad::new(5, 0, 0, 0),
            VersionQuad::new(7, 1, 400, 0),
            VersionQuad::new(7, 1, 431, 0),
        ] {
            let p = profile_for(kind_version);
            assert!(p.preconstructed(MessageIndex::StartA).is_some());
            assert!(p.preconstructed(MessageIndex::StartB).is_some());
        }
    }
}
