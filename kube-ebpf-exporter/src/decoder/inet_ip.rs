use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{bail, Result};

/// Render a 4- or 16-byte network address in its canonical text form.
///
/// Other non-empty lengths are kept visible as `?` followed by their hex bytes.
pub fn decode(input: &[u8]) -> Result<String> {
    if let Ok(octets) = <[u8; 4]>::try_from(input) {
        return Ok(Ipv4Addr::from(octets).to_string());
    }
    if let Ok(octets) = <[u8; 16]>::try_from(input) {
        return Ok(Ipv6Addr::from(octets).to_string());
    }
    if input.is_empty() {
        bail!("empty network address");
    }
    let hex: String = input.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("?{hex}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_v4_and_v6() {
        assert_eq!(decode(&[10, 0, 0, 1]).unwrap(), "10.0.0.1");
        let mut v6 = [0u8; 16];
        v6[0] = 0xfe;
        v6[1] = 0x80;
        v6[15] = 1;
        assert_eq!(decode(&v6).unwrap(), "fe80::1");
    }

    #[test]
    fn v4_mapped_v6_keeps_v6_form() {
        let mut mapped = [0u8; 16];
        mapped[10] = 0xff;
        mapped[11] = 0xff;
        mapped[12..].copy_from_slice(&[192, 168, 1, 2]);
        assert_eq!(decode(&mapped).unwrap(), "::ffff:192.168.1.2");
    }

    #[test]
    fn odd_lengths_stay_visible_and_empty_fails() {
        assert_eq!(decode(&[1, 2, 0xab]).unwrap(), "?0102ab");
        assert!(decode(&[]).is_err());
    }
}
