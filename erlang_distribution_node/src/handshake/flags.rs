//! Capability flags exchanged during the handshake.

#[allow(dead_code)]
pub mod dist_flags {
    /// The node is visible in the global namespace. Hidden nodes leave it unset.
    pub const DFLAG_PUBLISHED: u64 = 0x1;

    /// Three word references. Required from peers.
    pub const DFLAG_EXTENDED_REFERENCES: u64 = 0x4;

    /// Distributed process monitoring.
    pub const DFLAG_DIST_MONITOR: u64 = 0x8;

    pub const DFLAG_FUN_TAGS: u64 = 0x10;

    /// Monitors addressed by registered name.
    pub const DFLAG_DIST_MONITOR_NAME: u64 = 0x20;

    /// NEW_FUN_EXT.
    pub const DFLAG_NEW_FUN_TAGS: u64 = 0x80;

    /// Extended pids and ports. Required from peers.
    pub const DFLAG_EXTENDED_PIDS_PORTS: u64 = 0x100;

    /// EXPORT_EXT.
    pub const DFLAG_EXPORT_PTR_TAG: u64 = 0x200;

    /// BIT_BINARY_EXT.
    pub const DFLAG_BIT_BINARIES: u64 = 0x400;

    /// NEW_FLOAT_EXT.
    pub const DFLAG_NEW_FLOATS: u64 = 0x800;

    /// Atom cache in the distribution header. Never advertised.
    pub const DFLAG_DIST_HDR_ATOM_CACHE: u64 = 0x2000;

    pub const DFLAG_UTF8_ATOMS: u64 = 0x10000;

    pub const DFLAG_MAP_TAG: u64 = 0x20000;

    /// NEW_PID_EXT, NEW_PORT_EXT and NEWER_REFERENCE_EXT with 32-bit creation.
    pub const DFLAG_BIG_CREATION: u64 = 0x40000;

    /// SEND_SENDER in place of SEND. Never advertised.
    pub const DFLAG_SEND_SENDER: u64 = 0x80000;

    /// PAYLOAD variants of the exit signals. Never advertised.
    pub const DFLAG_EXIT_PAYLOAD: u64 = 0x400000;

    /// Fragmented messages. Never advertised.
    pub const DFLAG_FRAGMENTS: u64 = 0x800000;

    /// Version 6 handshake. Only sent in version 6 messages.
    pub const DFLAG_HANDSHAKE_23: u64 = 0x1000000;

    /// Unlinks travel as UNLINK_ID and are acknowledged.
    pub const DFLAG_UNLINK_ID: u64 = 0x2000000;

    /// Peer asks the acceptor to assign its name. Not supported.
    pub const DFLAG_NAME_ME: u64 = 1 << 33;

    /// Node container v4: wide pid, port and reference fields.
    pub const DFLAG_V4_NC: u64 = 1 << 34;

    /// Flags every current runtime insists on.
    pub fn mandatory_flags() -> u64 {
        DFLAG_EXTENDED_REFERENCES
            | DFLAG_FUN_TAGS
            | DFLAG_NEW_FUN_TAGS
            | DFLAG_EXTENDED_PIDS_PORTS
            | DFLAG_EXPORT_PTR_TAG
            | DFLAG_BIT_BINARIES
            | DFLAG_NEW_FLOATS
            | DFLAG_UTF8_ATOMS
            | DFLAG_MAP_TAG
            | DFLAG_BIG_CREATION
            | DFLAG_HANDSHAKE_23
            | DFLAG_UNLINK_ID
            | DFLAG_V4_NC
    }
}

use dist_flags::*;

/// Flags this node offers, before adjusting for the handshake version.
pub fn advertised(hidden: bool) -> u64 {
    let flags = (mandatory_flags() | DFLAG_DIST_MONITOR | DFLAG_DIST_MONITOR_NAME) & !DFLAG_HANDSHAKE_23;
    if hidden {
        flags
    } else {
        flags | DFLAG_PUBLISHED
    }
}

/// Flags a peer must offer for this node to talk to it.
pub fn required() -> u64 {
    DFLAG_EXTENDED_REFERENCES | DFLAG_EXTENDED_PIDS_PORTS
}

/// Shapes `flags` for a message of the given handshake version. Version 5
/// messages only carry the low 32 bits.
pub fn for_version(flags: u64, version: u16) -> u64 {
    if version >= 6 {
        flags | DFLAG_HANDSHAKE_23
    } else {
        flags & u64::from(u32::MAX) & !DFLAG_HANDSHAKE_23
    }
}

/// Bits of `required()` that `flags` lacks.
pub fn missing(flags: u64) -> u64 {
    required() & !flags
}
