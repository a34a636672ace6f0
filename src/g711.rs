//! G.711 μ-law の展開

/// μ-law 1バイトを16ビットリニアPCMへ展開
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = (u >> 4) & 0x07;
    let mantissa = (u & 0x0f) as i16;
    let magnitude = (((mantissa << 3) + 0x84) << exponent) - 0x84;
    if sign != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// μ-law のバイト列をリトルエンディアンの16ビットPCMバイト列へ展開
///
/// 出力は入力の2倍の長さになる。
pub fn mulaw_to_pcm_le(audio: &[u8]) -> Vec<u8> {
    audio
        .iter()
        .flat_map(|&b| mulaw_to_linear(b).to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mulaw_to_linear() {
        // 0xff と 0x7f は無音
        assert_eq!(mulaw_to_linear(0xff), 0);
        assert_eq!(mulaw_to_linear(0x7f), 0);
        assert_eq!(mulaw_to_linear(0x00), -32124);
        assert_eq!(mulaw_to_linear(0x80), 32124);
    }

    #[test]
    fn test_mulaw_to_pcm_le() {
        let pcm = mulaw_to_pcm_le(&[0xff, 0x80, 0x00]);
        assert_eq!(pcm.len(), 6);
        assert_eq!(&pcm[0..2], &[0, 0]);
        assert_eq!(i16::from_le_bytes([pcm[2], pcm[3]]), 32124);
        assert_eq!(i16::from_le_bytes([pcm[4], pcm[5]]), -32124);
    }
}
