//! Request decoding for the supported wire protocols.

/// The closed set of protocols a listener can speak. Picked once at server construction;
/// connections never renegotiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// Every received byte is echoed back verbatim.
    Echo,
    /// Redis-flavored ping: inline `PING\r\n` or the RESP array form, answered with
    /// `+PONG\r\n`. Anything else gets an `-ERR` reply.
    Ping,
}

const PONG: &[u8] = b"+PONG\r\n";
const ERR_UNKNOWN: &[u8] = b"-ERR unknown command\r\n";
const ERR_PROTOCOL: &[u8] = b"-ERR protocol error\r\n";

impl Protocol {
    /// Decode one request from the front of `buf`. On success the reply is appended to `out`
    /// and the number of consumed bytes returned; `None` means the buffer holds an incomplete
    /// request and more bytes are needed. Callers loop this to drain pipelined requests.
    pub fn decode(&self, buf: &[u8], out: &mut Vec<u8>) -> Option<usize> {
        if buf.is_empty() {
            return None;
        }
        match self {
            Protocol::Echo => {
                out.extend_from_slice(buf);
                Some(buf.len())
            }
            Protocol::Ping => decode_ping(buf, out),
        }
    }
}

fn decode_ping(buf: &[u8], out: &mut Vec<u8>) -> Option<usize> {
    if buf[0] == b'*' {
        return decode_resp(buf, out);
    }

    // Inline command: one line, terminated by LF with an optional preceding CR.
    let eol = buf.iter().position(|&b| b == b'\n')?;
    let line = &buf[..eol];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.is_empty() {
        // Empty lines are legal inline noise and produce no reply.
    } else if line.eq_ignore_ascii_case(b"ping") {
        out.extend_from_slice(PONG);
    } else {
        out.extend_from_slice(ERR_UNKNOWN);
    }
    Some(eol + 1)
}

/// RESP array of bulk strings, the form real clients send: `*1\r\n$4\r\nPING\r\n`.
fn decode_resp(buf: &[u8], out: &mut Vec<u8>) -> Option<usize> {
    let mut pos = 0;

    let (argc, used) = match read_number(&buf[pos..], b'*') {
        Ok(v) => v?,
        Err(()) => return malformed(buf, out),
    };
    pos += used;

    if argc < 1 {
        return malformed(buf, out);
    }

    let mut first_arg: Option<Vec<u8>> = None;
    for i in 0..argc {
        let (len, used) = match read_number(&buf[pos..], b'$') {
            Ok(v) => v?,
            Err(()) => return malformed(buf, out),
        };
        pos += used;

        let len = len as usize;
        if buf.len() < pos + len + 2 {
            return None;
        }
        if &buf[pos + len..pos + len + 2] != b"\r\n" {
            return malformed(buf, out);
        }
        if i == 0 {
            first_arg = Some(buf[pos..pos + len].to_vec());
        }
        pos += len + 2;
    }

    match first_arg {
        Some(cmd) if cmd.eq_ignore_ascii_case(b"ping") => out.extend_from_slice(PONG),
        _ => out.extend_from_slice(ERR_UNKNOWN),
    }
    Some(pos)
}

/// Parse `<prefix><decimal>\r\n`. `Ok(None)` needs more bytes, `Err` is malformed.
type NumResult = Result<Option<(i64, usize)>, ()>;

fn read_number(buf: &[u8], prefix: u8) -> NumResult {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != prefix {
        return Err(());
    }
    let Some(eol) = buf.iter().position(|&b| b == b'\n') else {
        // Cap how long we wait for a terminator on a garbage line.
        return if buf.len() > 32 { Err(()) } else { Ok(None) };
    };
    if eol < 2 || buf[eol - 1] != b'\r' {
        return Err(());
    }
    let digits = &buf[1..eol - 1];
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return Err(());
    }
    let mut value: i64 = 0;
    for &b in digits {
        value = value.checked_mul(10).ok_or(())?;
        value = value.checked_add((b - b'0') as i64).ok_or(())?;
    }
    Ok(Some((value, eol + 1)))
}

/// Garbage on the wire: answer with a protocol error and discard the buffer. The peer is
/// desynchronized anyway, so resynchronizing on its next request boundary is hopeless.
fn malformed(buf: &[u8], out: &mut Vec<u8>) -> Option<usize> {
    out.extend_from_slice(ERR_PROTOCOL);
    Some(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(proto: Protocol, input: &[u8]) -> (Option<usize>, Vec<u8>) {
        let mut out = Vec::new();
        let consumed = proto.decode(input, &mut out);
        (consumed, out)
    }

    #[test]
    fn echo_returns_everything() {
        let (consumed, out) = decode(Protocol::Echo, b"hello world");
        assert_eq!(consumed, Some(11));
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn echo_needs_at_least_one_byte() {
        let (consumed, out) = decode(Protocol::Echo, b"");
        assert_eq!(consumed, None);
        assert!(out.is_empty());
    }

    #[test]
    fn inline_ping_cases() {
        let (consumed, out) = decode(Protocol::Ping, b"PING\r\n");
        assert_eq!(consumed, Some(6));
        assert_eq!(out, b"+PONG\r\n");

        let (consumed, out) = decode(Protocol::Ping, b"ping\n");
        assert_eq!(consumed, Some(5));
        assert_eq!(out, b"+PONG\r\n");

        let (consumed, out) = decode(Protocol::Ping, b"FLUSH\r\n");
        assert_eq!(consumed, Some(7));
        assert_eq!(out, b"-ERR unknown command\r\n");
    }

    #[test]
    fn incomplete_inline_waits_for_more() {
        let (consumed, out) = decode(Protocol::Ping, b"PIN");
        assert_eq!(consumed, None);
        assert!(out.is_empty());
    }

    #[test]
    fn resp_ping() {
        let (consumed, out) = decode(Protocol::Ping, b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(consumed, Some(14));
        assert_eq!(out, b"+PONG\r\n");
    }

    #[test]
    fn resp_ping_is_case_insensitive() {
        let (consumed, out) = decode(Protocol::Ping, b"*1\r\n$4\r\nping\r\n");
        assert_eq!(consumed, Some(14));
        assert_eq!(out, b"+PONG\r\n");
    }

    #[test]
    fn resp_partial_waits_for_more() {
        for cut in 1..14 {
            let input = &b"*1\r\n$4\r\nPING\r\n"[..cut];
            let (consumed, out) = decode(Protocol::Ping, input);
            assert_eq!(consumed, None, "cut at {cut}");
            assert!(out.is_empty());
        }
    }

    #[test]
    fn resp_unknown_command() {
        let (consumed, out) = decode(Protocol::Ping, b"*1\r\n$3\r\nGET\r\n");
        assert_eq!(consumed, Some(13));
        assert_eq!(out, b"-ERR unknown command\r\n");
    }

    #[test]
    fn resp_malformed_is_answered_and_discarded() {
        let (consumed, out) = decode(Protocol::Ping, b"*x\r\njunk");
        assert_eq!(consumed, Some(8));
        assert_eq!(out, b"-ERR protocol error\r\n");
    }

    #[test]
    fn pipelined_requests_decode_one_at_a_time() {
        let input = b"PING\r\nPING\r\n";
        let mut out = Vec::new();
        let first = Protocol::Ping.decode(input, &mut out).unwrap();
        let second = Protocol::Ping.decode(&input[first..], &mut out).unwrap();
        assert_eq!(first + second, input.len());
        assert_eq!(out, b"+PONG\r\n+PONG\r\n");
    }
}
