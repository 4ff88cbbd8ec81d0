/// Terminator closing every WHOIS response.
pub const RESPONSE_TERMINATOR: &[u8] = b"\r\n";

/// Converts an upstream HTTP body into WHOIS wire format.
///
/// Every bare `\n` becomes `\r\n`, existing `\r\n` pairs are left alone, and a
/// final `\r\n` is appended so the response ends with a blank line.
#[must_use]
pub fn translate_line_endings(body: &[u8]) -> Vec<u8> {
    let bare_newlines = body
        .iter()
        .enumerate()
        .filter(|&(i, &b)| b == b'\n' && (i == 0 || body[i - 1] != b'\r'))
        .count();

    let mut out = Vec::with_capacity(body.len() + bare_newlines + RESPONSE_TERMINATOR.len());
    let mut prev = None;
    for &b in body {
        if b == b'\n' && prev != Some(b'\r') {
            out.push(b'\r');
        }
        out.push(b);
        prev = Some(b);
    }
    out.extend_from_slice(RESPONSE_TERMINATOR);
    out
}
