//! MySQL 프로토콜 패킷 처리
//!
//! 패킷 형식: 3바이트 길이 + 1바이트 시퀀스 + 본문.
//! 본문이 0xFFFFFF 바이트 이상이면 여러 패킷으로 나뉘어 전송됩니다.

use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Read;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// 한 패킷 본문의 최대 길이
pub const MAX_PACKET_LENGTH: usize = 0xFF_FFFF;

/// 명령 코드
pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_BINLOG_DUMP: u8 = 0x12;
    pub const COM_REGISTER_SLAVE: u8 = 0x15;
}

/// MySQL 패킷 채널
pub struct PacketChannel<S = TcpStream> {
    stream: S,
    sequence: u8,
}

impl PacketChannel<TcpStream> {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(hostname: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel::new(stream))
    }
}

impl<S> PacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        PacketChannel { stream, sequence: 0 }
    }

    /// 새 명령 시작 전 시퀀스 초기화
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// 패킷 읽기 (분할된 패킷은 이어 붙임)
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 4];
            self.stream
                .read_exact(&mut header)
                .await
                .map_err(|e| CdcError::IoError(format!("Failed to read packet header: {}", e)))?;

            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .map_err(|e| CdcError::IoError(format!("Failed to read packet body: {}", e)))?;

            if length < MAX_PACKET_LENGTH {
                return Ok(payload);
            }
        }
    }

    /// 패킷 쓰기 (현재 시퀀스 사용)
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut last_len = 0;
        for chunk in data.chunks(MAX_PACKET_LENGTH) {
            self.write_chunk(chunk).await?;
            last_len = chunk.len();
        }

        // 정확히 최대 길이로 끝나면 빈 패킷으로 종료 표시
        if data.is_empty() || last_len == MAX_PACKET_LENGTH {
            self.write_chunk(&[]).await?;
        }

        self.stream
            .flush()
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to flush: {}", e)))?;
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let len = chunk.len() as u32;
        let header = [
            (len & 0xFF) as u8,
            ((len >> 8) & 0xFF) as u8,
            ((len >> 16) & 0xFF) as u8,
            self.sequence,
        ];
        self.sequence = self.sequence.wrapping_add(1);

        self.stream
            .write_all(&header)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to write header: {}", e)))?;
        self.stream
            .write_all(chunk)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to write data: {}", e)))?;
        Ok(())
    }

    /// 시퀀스를 초기화하고 명령 패킷 전송
    pub async fn send_command(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        let mut packet = Vec::with_capacity(payload.len() + 1);
        packet.push(command);
        packet.extend_from_slice(payload);
        self.reset_sequence();
        self.write_packet(&packet).await
    }

    /// 응답이 OK인지 확인. 오류 패킷이면 `ProtocolError`
    pub async fn expect_ok(&mut self, context: &str) -> Result<Vec<u8>> {
        let packet = self.read_packet().await?;
        if is_error_packet(&packet) {
            let err = ErrorPacket::parse(&packet)?;
            return Err(CdcError::ProtocolError(format!("{} failed: {}", context, err)));
        }
        Ok(packet)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to shut down socket: {}", e)))
    }
}

/// Greeting 패킷 파싱
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin_name: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if is_error_packet(data) {
            let err = ErrorPacket::parse(data)?;
            return Err(CdcError::ConnectionError(format!("Server refused connection: {}", err)));
        }

        let mut cursor = std::io::Cursor::new(data);

        let protocol_version = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read protocol version: {}", e)))?;

        let server_version = read_null_terminated_string(&mut cursor)?;

        let thread_id = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read thread ID: {}", e)))?;

        // Auth plugin data part 1 (8 bytes)
        let mut scramble = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut scramble)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read scramble part 1: {}", e)))?;

        // Filler
        ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read filler: {}", e)))?;

        let capabilities_lower = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read capabilities: {}", e)))?;

        let server_collation = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read collation: {}", e)))?;

        let server_status = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read status: {}", e)))?;

        let capabilities_upper = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read capabilities upper: {}", e)))?;

        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read auth data length: {}", e)))?;

        // Reserved (10 bytes)
        let mut reserved = [0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read reserved: {}", e)))?;

        // Auth plugin data part 2 (최소 13바이트, 마지막은 NUL)
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut part2 = vec![0u8; part2_len];
        Read::read_exact(&mut cursor, &mut part2)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read scramble part 2: {}", e)))?;
        if part2.last() == Some(&0) {
            part2.pop();
        }
        scramble.extend_from_slice(&part2);

        let auth_plugin_name = if server_capabilities & crate::auth::capabilities::PLUGIN_AUTH != 0 {
            read_null_terminated_string(&mut cursor).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin_name,
        })
    }
}

/// 오류 패킷 (0xFF)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: u16,
    pub sql_state: Option<String>,
    pub message: String,
}

impl ErrorPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !is_error_packet(data) || data.len() < 3 {
            return Err(CdcError::ProtocolError("Not an error packet".to_string()));
        }
        let code = u16::from_le_bytes([data[1], data[2]]);
        let (sql_state, message) = if data.len() >= 9 && data[3] == b'#' {
            (
                Some(String::from_utf8_lossy(&data[4..9]).into_owned()),
                &data[9..],
            )
        } else {
            (None, &data[3..])
        };

        Ok(ErrorPacket {
            code,
            sql_state,
            message: String::from_utf8_lossy(message).into_owned(),
        })
    }
}

impl std::fmt::Display for ErrorPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sql_state {
            Some(state) => write!(f, "ERROR {} ({}): {}", self.code, state, self.message),
            None => write!(f, "ERROR {}: {}", self.code, self.message),
        }
    }
}

/// null로 끝나는 문자열 읽기
pub fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = ReadBytesExt::read_u8(reader)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read string byte: {}", e)))?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| CdcError::ProtocolError(format!("Invalid UTF-8 in string: {}", e)))
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFF
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0x00
}

/// EOF 패킷 확인 (0xFE로 시작하는 9바이트 미만 패킷)
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFE && data.len() < 9
}
