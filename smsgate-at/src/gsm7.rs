//! GSM 03.38 default alphabet.

const ESCAPE: u8 = 0x1B;

#[rustfmt::skip]
const BASIC: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å',
    'Δ', '_', 'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', '\u{A0}', 'Æ', 'æ', 'ß', 'É',
    ' ', '!', '"', '#', '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/',
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?',
    '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O',
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ñ', 'Ü', '§',
    '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o',
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à',
];

fn extension(code: u8) -> Option<char> {
    Some(match code {
        0x0A => '\u{0C}',
        0x14 => '^',
        0x28 => '{',
        0x29 => '}',
        0x2F => '\\',
        0x3C => '[',
        0x3D => '~',
        0x3E => ']',
        0x40 => '|',
        0x65 => '€',
        _ => return None,
    })
}

/// Number of octets holding `count` packed septets.
pub fn packed_len(count: usize) -> usize {
    (count * 7).div_ceil(8)
}

/// Unpack `count` septets from `data`. `None` when `data` is too short.
pub fn unpack(data: &[u8], count: usize) -> Option<Vec<u8>> {
    if data.len() < packed_len(count) {
        return None;
    }

    let septets = (0..count)
        .map(|i| {
            let bit = i * 7;
            let (byte, shift) = (bit / 8, bit % 8);
            let mut value = u16::from(data[byte]) >> shift;
            if shift > 1 {
                if let Some(next) = data.get(byte + 1) {
                    value |= u16::from(*next) << (8 - shift);
                }
            }
            (value & 0x7F) as u8
        })
        .collect();

    Some(septets)
}

/// Map septets to text, resolving escape sequences. An escape with no
/// extension mapping falls back to the basic character.
pub fn decode(septets: &[u8]) -> String {
    let mut out = String::with_capacity(septets.len());
    let mut iter = septets.iter().copied();

    while let Some(code) = iter.next() {
        if code == ESCAPE {
            match iter.next() {
                Some(next) => out.push(extension(next).unwrap_or(BASIC[usize::from(next & 0x7F)])),
                None => out.push(' '),
            }
        } else {
            out.push(BASIC[usize::from(code & 0x7F)]);
        }
    }
    out
}
