/// Number of random padding bytes is drawn from `1..=MAX_PADDING`.
pub const MAX_PADDING: u8 = 15;
/// Highest one-time prekey id before ids wrap around.
pub const MAX_PRE_KEY_ID: u32 = 0x00FF_FFFF;
/// Registration ids are 14-bit values in `1..=MAX_REGISTRATION_ID`.
pub const MAX_REGISTRATION_ID: u32 = 16380;
/// Prologue mixed into every transport handshake.
pub const HANDSHAKE_PROLOGUE: &[u8] = b"CR\x01\x00";
/// Encryption envelope version for multi-payload messages.
pub const ENC_VERSION: &str = "2";
/// Encryption envelope version of the legacy single-payload form.
pub const LEGACY_ENC_VERSION: &str = "1";
