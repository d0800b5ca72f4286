use anyhow::{bail, Result};

/// Host-order unsigned integer of 1, 2, 4 or 8 bytes, in decimal.
pub fn uint(input: &[u8]) -> Result<String> {
    let value = match input.len() {
        1 => u64::from(input[0]),
        2 => u64::from(u16::from_ne_bytes([input[0], input[1]])),
        4 => u64::from(u32::from_ne_bytes([input[0], input[1], input[2], input[3]])),
        8 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(input);
            u64::from_ne_bytes(bytes)
        }
        other => bail!("unknown value length {other} for {input:?}"),
    };
    Ok(value.to_string())
}

/// Bytes up to the first NUL, as written by `bpf_get_current_comm()`.
pub fn string(input: &[u8]) -> Vec<u8> {
    let end = input.iter().position(|&b| b == 0).unwrap_or(input.len());
    input[..end].to_vec()
}

/// Kernel-internal `dev_t` (12-bit major, 20-bit minor) as `major:minor`.
pub fn major_minor(input: &[u8]) -> Result<String> {
    let Ok(bytes) = <[u8; 4]>::try_from(input) else {
        bail!("dev_t must be 4 bytes, got {}", input.len());
    };
    let dev = u32::from_ne_bytes(bytes);
    Ok(format!("{}:{}", dev >> 20, dev & 0xfffff))
}
