#![forbid(unsafe_code)]

pub mod cli;
pub mod proxy;

/// Maps a child's exit status onto the byte a process can exit with.
/// A child killed by a signal reports no code and maps to 1.
#[must_use]
pub fn exit_code_byte(code: Option<i32>) -> u8 {
    code.map_or(1, |code| (code & 0xff) as u8)
}

#[cfg(test)]
mod tests {
    use super::exit_code_byte;

    #[test]
    fn exit_codes_pass_through() {
        assert_eq!(exit_code_byte(Some(0)), 0);
        assert_eq!(exit_code_byte(Some(125)), 125);
        assert_eq!(exit_code_byte(None), 1);
    }
}
