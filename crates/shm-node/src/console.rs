//! Default [`BoardControl`]: a short-lived TCP console client.
//!
//! Grounded in `original_source/.../sockets.py`'s `SocketClient.__connect`: one fresh
//! connection per command, a banner wait for `SHM_console#`, the command, the response,
//! then `Q` and close. The original's `SO_TIMESTAMPNS` attempt on the console socket is
//! dropped along with the rest of the kernel-timestamp path (see `shm-socket-server`);
//! it has no bearing on console command/response semantics.
//!
//! The info response (§6.2: `UUID`, `MAC`, `frequency`, `nreports`, `nchannels`,
//! `channels`, `headerlen`, `basedatalen`) is JSON-like with single rather than double
//! quotes, mirroring the original's own `.replace("'", "\"")` step before decoding.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use shm_protocol::ChannelMap;
use tracing::debug;

use crate::board::{BoardControl, BoardError, BoardInfo, BoardResult};

const CONSOLE_TIMEOUT: Duration = Duration::from_secs(5);
const BANNER: &str = "SHM_console#";
const RECV_BUF: usize = 1024;

/// TCP console client talking to the board at `board_ip:board_port`.
pub struct ConsoleBoardControl {
    board_ip: String,
    board_port: u16,
}

impl ConsoleBoardControl {
    /// Build a client targeting `board_ip:board_port`. Opens no connection yet — every
    /// command below connects fresh, per the original's own per-command session model.
    #[must_use]
    pub fn new(board_ip: impl Into<String>, board_port: u16) -> Self {
        Self { board_ip: board_ip.into(), board_port }
    }

    fn connect(&self) -> BoardResult<TcpStream> {
        let stream = TcpStream::connect((self.board_ip.as_str(), self.board_port))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(CONSOLE_TIMEOUT))?;
        stream.set_write_timeout(Some(CONSOLE_TIMEOUT))?;
        debug!(board_ip = %self.board_ip, board_port = self.board_port, "connected to board console");
        Ok(stream)
    }

    fn wait_for_banner(stream: &mut TcpStream) -> BoardResult<()> {
        let mut buf = [0_u8; RECV_BUF];
        let mut acc = String::new();
        while !acc.contains(BANNER) {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Err(BoardError::Protocol("connection closed before banner".to_string()));
            }
            acc.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        Ok(())
    }

    fn send_command(stream: &mut TcpStream, command: &str) -> BoardResult<String> {
        stream.write_all(command.as_bytes())?;
        let mut buf = [0_u8; RECV_BUF];
        let n = stream.read(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf[..n]).trim().to_string())
    }

    fn quit(stream: &mut TcpStream) {
        let _ = stream.write_all(b"Q");
    }
}

impl BoardControl for ConsoleBoardControl {
    fn info(&self) -> BoardResult<BoardInfo> {
        let mut stream = self.connect()?;
        Self::wait_for_banner(&mut stream)?;
        let response = Self::send_command(&mut stream, "1")?;
        Self::quit(&mut stream);
        parse_info_response(&response)
    }

    fn configure(&self, sensor_host: &str, sensor_port: u16) -> BoardResult<()> {
        let mut stream = self.connect()?;
        Self::wait_for_banner(&mut stream)?;
        let command = format!("C {sensor_host}:{sensor_port}");
        let response = Self::send_command(&mut stream, &command)?;
        Self::quit(&mut stream);
        expect_ok(&response, "configure the board")
    }

    fn start_sampling(&self, header_only: bool) -> BoardResult<u64> {
        let mut stream = self.connect()?;
        Self::wait_for_banner(&mut stream)?;
        let ts_ms = wall_clock_ms();
        let command = if header_only {
            format!("2 1;tStamp={ts_ms}")
        } else {
            format!("2;tStamp={ts_ms}")
        };
        let response = Self::send_command(&mut stream, &command)?;
        Self::quit(&mut stream);
        expect_ok(&response, "start sampling")?;
        Ok(ts_ms)
    }

    fn stop_sampling(&self) -> BoardResult<()> {
        let mut stream = self.connect()?;
        Self::wait_for_banner(&mut stream)?;
        let response = Self::send_command(&mut stream, "3")?;
        Self::quit(&mut stream);
        expect_ok(&response, "stop sampling")
    }

    fn reset(&self) -> BoardResult<()> {
        let mut stream = self.connect()?;
        Self::wait_for_banner(&mut stream)?;
        stream.write_all(b"7 1")?;
        Self::quit(&mut stream);
        Ok(())
    }
}

fn expect_ok(response: &str, action: &str) -> BoardResult<()> {
    if response.contains("[OK]") {
        Ok(())
    } else if response.contains("[KO]") {
        Err(BoardError::Rejected(action.to_string()))
    } else {
        Err(BoardError::Protocol(format!("unexpected response to {action}: {response:?}")))
    }
}

fn parse_info_response(raw: &str) -> BoardResult<BoardInfo> {
    let json_like = raw.replace('\'', "\"");
    let value: Value = serde_json::from_str(&json_like)
        .map_err(|err| BoardError::Protocol(format!("could not parse info response: {err}")))?;

    let uuid = json_string(&value, "UUID")?;
    let mac = json_string(&value, "MAC")?;
    let frequency = u32::try_from(json_u64(&value, "frequency")?)
        .map_err(|_| BoardError::Protocol("frequency out of range".to_string()))?;
    let nreports = u8::try_from(json_u64(&value, "nreports")?)
        .map_err(|_| BoardError::Protocol("nreports out of range".to_string()))?;
    let channels = ChannelMap::parse(&json_string(&value, "channels")?)?;
    let header_len = usize::try_from(json_u64(&value, "headerlen")?)
        .map_err(|_| BoardError::Protocol("headerlen out of range".to_string()))?;
    let report_len = usize::try_from(json_u64(&value, "basedatalen")?)
        .map_err(|_| BoardError::Protocol("basedatalen out of range".to_string()))?;

    Ok(BoardInfo { uuid, mac, frequency, nreports, channels, header_len, report_len })
}

fn json_string(value: &Value, key: &str) -> BoardResult<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BoardError::Protocol(format!("info response missing string field {key:?}")))
}

fn json_u64(value: &Value, key: &str) -> BoardResult<u64> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| BoardError::Protocol(format!("info response missing numeric field {key:?}")))
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
