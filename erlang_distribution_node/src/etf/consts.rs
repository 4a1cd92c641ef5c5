/// Leading byte of every externally encoded term.
pub const VERSION_TAG: u8 = 131;

/// Leading byte of a steady-state distribution frame without a distribution header.
pub const PASS_THROUGH: u8 = 112;

#[allow(dead_code)]
pub mod tag {
    // Atoms
    pub const ATOM_UTF8_EXT: u8 = 118;
    pub const SMALL_ATOM_UTF8_EXT: u8 = 119;
    pub const ATOM_EXT: u8 = 100; // latin-1, decode only
    pub const SMALL_ATOM_EXT: u8 = 115; // latin-1, decode only

    // Numbers
    pub const SMALL_INTEGER_EXT: u8 = 97;
    pub const INTEGER_EXT: u8 = 98;
    pub const FLOAT_EXT: u8 = 99; // decode only
    pub const NEW_FLOAT_EXT: u8 = 70;
    pub const SMALL_BIG_EXT: u8 = 110;
    pub const LARGE_BIG_EXT: u8 = 111;

    // Identities
    pub const PID_EXT: u8 = 103;
    pub const NEW_PID_EXT: u8 = 88;
    pub const PORT_EXT: u8 = 102;
    pub const NEW_PORT_EXT: u8 = 89;
    pub const V4_PORT_EXT: u8 = 120;
    pub const REFERENCE_EXT: u8 = 101;
    pub const NEW_REFERENCE_EXT: u8 = 114;
    pub const NEWER_REFERENCE_EXT: u8 = 90;

    // Compounds
    pub const SMALL_TUPLE_EXT: u8 = 104;
    pub const LARGE_TUPLE_EXT: u8 = 105;
    pub const MAP_EXT: u8 = 116;
    pub const NIL_EXT: u8 = 106;
    pub const STRING_EXT: u8 = 107;
    pub const LIST_EXT: u8 = 108;

    // Binaries
    pub const BINARY_EXT: u8 = 109;
    pub const BIT_BINARY_EXT: u8 = 77;

    // Functions
    pub const NEW_FUN_EXT: u8 = 112;
    pub const EXPORT_EXT: u8 = 113;
}

/// Largest element count that still fits the STRING_EXT length field.
pub const MAX_STRING_EXT_LEN: usize = u16::MAX as usize;

/// Longest atom a node accepts, in characters.
pub const MAX_ATOM_CHARS: usize = 255;

/// Ports with ids wider than this need V4_PORT_EXT.
pub const NEW_PORT_ID_MAX: u64 = 0x0fff_ffff;
