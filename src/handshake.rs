use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Read a VarInt (Minecraft format) from the buffer, returning `(value, bytes_read)`.
/// Returns `None` if the buffer ends mid-VarInt or the encoding overruns 5 bytes.
pub fn read_varint(buf: &[u8]) -> Option<(i32, usize)> {
    let mut num_read = 0;
    let mut result: i32 = 0;
    for &byte in buf.iter() {
        let val = (byte & 0x7F) as i32;
        result |= val << (7 * num_read);
        num_read += 1;
        if byte & 0x80 == 0 {
            return Some((result, num_read));
        }
        if num_read >= 5 {
            return None;
        }
    }
    None
}

/// Write a VarInt (Minecraft format) to `buf`.
pub fn write_varint(mut val: i32, buf: &mut Vec<u8>) {
    loop {
        if (val & !0x7F) == 0 {
            buf.push(val as u8);
            return;
        }
        buf.push(((val & 0x7F) | 0x80) as u8);
        val = ((val as u32) >> 7) as i32;
    }
}

/// Outcome of classifying the first bytes a client sends after `accept`.
#[derive(Debug, PartialEq, Eq)]
pub enum Intent {
    /// Server-list ping (terminal byte `0x00` or `0x01`).
    Status,
    /// Join attempt (terminal byte `0x02`), carrying the decoded player name.
    Login { player_name: String },
    /// Any other terminal byte; caller must close the connection without reply.
    Unknown,
}

const HANDSHAKE_READ_LIMIT: usize = 64;

/// Reads the handshake packet and classifies client intent from its terminal byte.
///
/// Full protocol parsing is deliberately avoided: only the "next state" byte at
/// the end of the handshake packet is inspected, which keeps this classifier stable
/// across protocol-version drift as long as that byte's meaning does not change.
pub async fn classify(socket: &mut TcpStream, peer: SocketAddr) -> std::io::Result<Intent> {
    let mut buf = [0u8; HANDSHAKE_READ_LIMIT];
    let n = match socket.read(&mut buf).await {
        Ok(0) => {
            log::debug!("Connection closed immediately by {peer}");
            return Ok(Intent::Unknown);
        }
        Ok(n) => n,
        Err(e) if e.kind() == ErrorKind::ConnectionReset => {
            log::debug!("Connection reset by peer {peer} during handshake (ignoring)");
            return Ok(Intent::Unknown);
        }
        Err(e) => return Err(e),
    };

    log::debug!("Received {n} handshake bytes from {peer}: {:02X?}", &buf[..n]);

    match buf[n - 1] {
        0x00 | 0x01 => Ok(Intent::Status),
        0x02 => {
            let mut login_buf = [0u8; HANDSHAKE_READ_LIMIT];
            let login_n = socket.read(&mut login_buf).await?;
            let player_name = decode_player_name(&login_buf[..login_n]);
            Ok(Intent::Login { player_name })
        }
        other => {
            log::debug!("Unknown terminal byte 0x{other:02X} from {peer}, closing");
            Ok(Intent::Unknown)
        }
    }
}

/// Decodes the length-prefixed UTF-8 player name at offset 3 of a login-start packet,
/// replacing invalid sequences and mapping an empty name to `"player unknown"`.
fn decode_player_name(buf: &[u8]) -> String {
    if buf.len() <= 3 {
        return "player unknown".to_string();
    }
    let name = String::from_utf8_lossy(&buf[3..]).into_owned();
    if name.is_empty() {
        "player unknown".to_string()
    } else {
        name
    }
}

/// Reads the status ping's nonce, re-reading once if the first read was just the
/// request framing bytes (`{0x01, 0x00}`) rather than the payload itself.
pub async fn read_ping_nonce(socket: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
        .await
        .unwrap_or(Ok(0))?;
    if n == 2 && buf[..2] == [0x01, 0x00] {
        let n2 = socket.read(&mut buf).await?;
        return Ok(buf[..n2].to_vec());
    }
    Ok(buf[..n].to_vec())
}
