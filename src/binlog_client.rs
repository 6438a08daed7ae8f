//! MySQL Binlog 클라이언트
//!
//! 복제 클라이언트로 서버에 등록한 뒤 COM_BINLOG_DUMP로 이벤트를 받아
//! `RawNotification`으로 전달합니다.
//!
//! 재시작 위치 규칙:
//! - 행 이벤트는 앞선 TABLE_MAP 없이는 해석할 수 없으므로 checkpoint는 TABLE_MAP 그룹의 시작
//! - STMT_END 플래그가 있는 행 이벤트 뒤에서만 다음 이벤트 위치로 진행
//! - 그 외 이벤트는 열린 그룹이 없으면 이벤트 끝 위치

use crate::auth::{self, AuthPlugin};
use crate::binlog::{BinlogDecoder, BinlogEvent, LOG_EVENT_ARTIFICIAL_F};
use crate::column::ColumnInfo;
use crate::config::ConnectionProfile;
use crate::connection::{self, MySqlConnection};
use crate::error::{CdcError, Result};
use crate::events::{EventHeader, EventType, NotificationBody, RawNotification, TableMapData};
use crate::offset::BinlogPosition;
use crate::protocol::{
    command, is_eof_packet, read_null_terminated_string, ErrorPacket, GreetingPacket,
    PacketChannel,
};
use crate::source::{NotificationStream, ReplicationSource, SegmentCatalog};
use async_trait::async_trait;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{Cursor, Write};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// MySQL 서버 어댑터
#[derive(Debug, Clone, Default)]
pub struct MySqlSource;

impl MySqlSource {
    pub fn new() -> Self {
        MySqlSource
    }
}

#[async_trait]
impl SegmentCatalog for MySqlSource {
    async fn list_segments(&self, profile: &ConnectionProfile) -> Result<Vec<String>> {
        connection::list_binary_logs(profile).await.map_err(into_connection_error)
    }
}

#[async_trait]
impl ReplicationSource for MySqlSource {
    type Stream = BinlogClient;

    async fn open(
        &self,
        profile: &ConnectionProfile,
        server_id: u32,
        position: &BinlogPosition,
    ) -> Result<BinlogClient> {
        BinlogClient::connect(profile, server_id, position)
            .await
            .map_err(into_connection_error)
    }
}

fn into_connection_error(e: CdcError) -> CdcError {
    match e {
        CdcError::ConnectionError(_) | CdcError::ValidationError(_) => e,
        other => CdcError::ConnectionError(other.to_string()),
    }
}

/// 테이블 컬럼 정보 조회 (관리용 연결을 필요할 때 엶)
pub struct SchemaLoader {
    profile: ConnectionProfile,
    conn: Option<MySqlConnection>,
}

impl SchemaLoader {
    pub fn with_connection(profile: ConnectionProfile, conn: MySqlConnection) -> Self {
        SchemaLoader {
            profile,
            conn: Some(conn),
        }
    }

    pub async fn load(&mut self, database: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        if self.conn.is_none() {
            self.conn = Some(MySqlConnection::connect(&self.profile).await?);
        }
        let result = match self.conn.as_mut() {
            Some(conn) => conn.get_table_schema(database, table).await,
            None => Err(CdcError::NotConnected),
        };
        if result.is_err() {
            // 다음 조회에서 다시 연결
            self.conn = None;
        }
        result
    }

    pub async fn close(mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

/// 핸드셰이크 및 인증
pub async fn authenticate<S>(
    channel: &mut PacketChannel<S>,
    profile: &ConnectionProfile,
) -> Result<GreetingPacket>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = GreetingPacket::parse(&channel.read_packet().await?)?;
    info!(
        "MySQL Server version: {}, Thread ID: {}",
        greeting.server_version, greeting.thread_id
    );

    let plugin = AuthPlugin::from_name(&greeting.auth_plugin_name).unwrap_or_else(|| {
        debug!(
            plugin = %greeting.auth_plugin_name,
            "Unknown default auth plugin, answering with mysql_native_password"
        );
        AuthPlugin::NativePassword
    });

    let response = auth::create_handshake_response(
        profile.user(),
        profile.password(),
        Some(profile.database()),
        &greeting.scramble,
        profile.collation_id(),
        plugin,
    )
    .map_err(|e| CdcError::ConnectionError(format!("Failed to create auth response: {}", e)))?;
    channel.write_packet(&response).await?;

    loop {
        let packet = channel.read_packet().await?;
        match packet.first() {
            Some(0x00) => {
                info!("Authentication successful");
                return Ok(greeting);
            }
            Some(0xFF) => {
                let err = ErrorPacket::parse(&packet)?;
                return Err(CdcError::ConnectionError(format!(
                    "Authentication failed: {}",
                    err
                )));
            }
            Some(0xFE) => {
                // Auth switch: 플러그인 이름 + 새 nonce
                let mut cursor = Cursor::new(&packet[1..]);
                let name = read_null_terminated_string(&mut cursor)?;
                let rest = &packet[1 + cursor.position() as usize..];
                let nonce = rest.strip_suffix(&[0]).unwrap_or(rest);

                let switched = AuthPlugin::from_name(&name).ok_or_else(|| {
                    CdcError::ConnectionError(format!("Unsupported auth plugin: {}", name))
                })?;
                debug!(plugin = switched.name(), "Server requested auth switch");
                channel
                    .write_packet(&switched.scramble(profile.password(), nonce))
                    .await?;
            }
            Some(0x01) => match packet.get(1) {
                // caching_sha2_password fast auth 성공, 이어서 OK 패킷
                Some(0x03) => continue,
                Some(0x04) => {
                    return Err(CdcError::ConnectionError(
                        "caching_sha2_password full authentication needs TLS or RSA key exchange, \
                         which this client does not support"
                            .to_string(),
                    ))
                }
                _ => {
                    return Err(CdcError::ProtocolError(
                        "Unexpected auth-more-data packet".to_string(),
                    ))
                }
            },
            _ => {
                return Err(CdcError::ProtocolError(
                    "Unexpected authentication response".to_string(),
                ))
            }
        }
    }
}

/// COM_BINLOG_DUMP 본문 (명령 바이트 제외)
fn binlog_dump_payload(server_id: u32, position: &BinlogPosition) -> Result<Vec<u8>> {
    let offset = u32::try_from(position.position).map_err(|_| {
        CdcError::ValidationError(format!(
            "Binlog position {} does not fit the dump request",
            position.position
        ))
    })?;

    let mut buffer = Vec::new();
    buffer.write_u32::<LittleEndian>(offset)?;
    // Flags - 0이면 새 이벤트를 기다림 (blocking)
    buffer.write_u16::<LittleEndian>(0)?;
    buffer.write_u32::<LittleEndian>(server_id)?;
    buffer.write_all(position.filename.as_bytes())?;
    Ok(buffer)
}

/// COM_REGISTER_SLAVE 본문
fn register_replica_payload(server_id: u32) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer.write_u32::<LittleEndian>(server_id)?;
    buffer.write_u8(0)?; // hostname
    buffer.write_u8(0)?; // user
    buffer.write_u8(0)?; // password
    buffer.write_u16::<LittleEndian>(0)?; // port
    buffer.write_u32::<LittleEndian>(0)?; // replication rank
    buffer.write_u32::<LittleEndian>(0)?; // master id
    Ok(buffer)
}

/// Binlog 클라이언트
pub struct BinlogClient<S = TcpStream> {
    channel: PacketChannel<S>,
    decoder: BinlogDecoder,
    schema: Option<SchemaLoader>,
    /// 현재 binlog 파일
    file: String,
    /// 열린 그룹이 없을 때 재연결에 안전한 위치
    safe: BinlogPosition,
    /// 현재 TABLE_MAP 그룹 시작 오프셋
    group_start: Option<u64>,
    events_read: u64,
    closed: bool,
}

impl BinlogClient<TcpStream> {
    /// 서버에 연결하고 `position`부터 덤프 시작
    pub async fn connect(
        profile: &ConnectionProfile,
        server_id: u32,
        position: &BinlogPosition,
    ) -> Result<Self> {
        let mut admin = MySqlConnection::connect(profile).await?;
        let algorithm = match admin.binlog_checksum().await {
            Ok(algorithm) => algorithm,
            Err(e) => {
                if let Err(close_err) = admin.close().await {
                    warn!("Admin connection did not close cleanly: {}", close_err);
                }
                return Err(e);
            }
        };
        let checksum = !algorithm.eq_ignore_ascii_case("NONE");
        debug!(%algorithm, "Server binlog checksum");

        let schema = SchemaLoader::with_connection(profile.clone(), admin);

        let channel = async {
            let mut channel = PacketChannel::connect(profile.host(), profile.port()).await?;
            authenticate(&mut channel, profile).await?;
            Ok::<_, CdcError>(channel)
        }
        .await;

        match channel {
            Ok(channel) => BinlogClient::start(channel, server_id, position, checksum, Some(schema)).await,
            Err(e) => {
                if let Err(close_err) = schema.close().await {
                    warn!("Admin connection did not close cleanly: {}", close_err);
                }
                Err(e)
            }
        }
    }
}

impl<S> BinlogClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// 인증된 채널에서 체크섬 협상, 복제본 등록, 덤프 요청
    pub async fn start(
        mut channel: PacketChannel<S>,
        server_id: u32,
        position: &BinlogPosition,
        checksum: bool,
        schema: Option<SchemaLoader>,
    ) -> Result<Self> {
        if let Err(e) = Self::request_dump(&mut channel, server_id, position).await {
            if let Some(schema) = schema {
                if let Err(close_err) = schema.close().await {
                    warn!("Admin connection did not close cleanly: {}", close_err);
                }
            }
            return Err(e);
        }

        info!(%position, server_id, checksum, "Binlog dump requested");

        Ok(BinlogClient {
            channel,
            decoder: BinlogDecoder::new(checksum),
            schema,
            file: position.filename.clone(),
            safe: position.clone(),
            group_start: None,
            events_read: 0,
            closed: false,
        })
    }

    async fn request_dump(
        channel: &mut PacketChannel<S>,
        server_id: u32,
        position: &BinlogPosition,
    ) -> Result<()> {
        // 체크섬을 이해한다고 알려야 서버가 CRC32 이벤트를 보냄
        for statement in [
            "SET @master_binlog_checksum = @@global.binlog_checksum",
            "SET @source_binlog_checksum = @@global.binlog_checksum",
        ] {
            channel
                .send_command(command::COM_QUERY, statement.as_bytes())
                .await?;
            channel.expect_ok("Checksum negotiation").await?;
        }

        channel
            .send_command(command::COM_REGISTER_SLAVE, &register_replica_payload(server_id)?)
            .await?;
        channel.expect_ok("Replica registration").await?;

        let payload = binlog_dump_payload(server_id, position)?;
        channel.send_command(command::COM_BINLOG_DUMP, &payload).await
    }

    /// 디코더 접근 (스키마 미리 등록 등)
    pub fn decoder_mut(&mut self) -> &mut BinlogDecoder {
        &mut self.decoder
    }

    pub fn events_read(&self) -> u64 {
        self.events_read
    }

    pub fn current_file(&self) -> &str {
        &self.file
    }

    async fn read_notification(&mut self) -> Result<Option<RawNotification>> {
        if self.closed {
            return Ok(None);
        }

        let packet = self.channel.read_packet().await?;
        if is_eof_packet(&packet) {
            info!(events = self.events_read, "Server ended the binlog stream");
            return Ok(None);
        }
        match packet.first() {
            Some(0x00) => {}
            Some(0xFF) => {
                let err = ErrorPacket::parse(&packet)?;
                return Err(CdcError::ProtocolError(format!("Binlog stream error: {}", err)));
            }
            _ => {
                return Err(CdcError::ProtocolError(
                    "Unexpected packet in binlog stream".to_string(),
                ))
            }
        }

        let (header, event) = self.decoder.decode(&packet[1..])?;
        self.events_read += 1;

        if let BinlogEvent::TableMap(table_map) = &event {
            self.ensure_schema(table_map).await;
        }

        Ok(Some(self.track(header, event)))
    }

    /// 처음 보는 테이블이면 컬럼 이름 조회
    async fn ensure_schema(&mut self, table_map: &TableMapData) {
        let name = table_map.full_name();
        if self.decoder.has_schema(&name) {
            return;
        }
        let Some(loader) = self.schema.as_mut() else {
            return;
        };

        let columns = match loader.load(&table_map.database, &table_map.table).await {
            Ok(columns) => {
                debug!(table = %name, columns = columns.len(), "Loaded table schema");
                columns
            }
            Err(e) => {
                warn!(table = %name, "Schema lookup failed, using positional column names: {}", e);
                Vec::new()
            }
        };
        self.decoder.register_schema(name, columns);
    }

    fn at(&self, offset: u64) -> BinlogPosition {
        BinlogPosition::new(self.file.clone(), offset)
    }

    /// 이벤트를 알림으로 변환하고 재시작 위치 갱신
    fn track(&mut self, header: EventHeader, event: BinlogEvent) -> RawNotification {
        let end = header.next_pos as u64;
        let start = end.saturating_sub(header.event_length as u64);
        let artificial = end == 0 || header.flags & LOG_EVENT_ARTIFICIAL_F != 0;

        let (body, checkpoint, resume_after) = match event {
            BinlogEvent::Rotate(rotate) => {
                debug!(file = %rotate.next_binlog_name, position = rotate.position, "Rotate");
                self.file = rotate.next_binlog_name;
                self.group_start = None;
                self.safe = self.at(rotate.position);
                (
                    NotificationBody::Other(EventType::RotateEvent),
                    self.safe.clone(),
                    self.safe.clone(),
                )
            }
            BinlogEvent::TableMap(_) => {
                let group = *self.group_start.get_or_insert(start);
                let position = self.at(group);
                (
                    NotificationBody::Other(EventType::TableMapEvent),
                    position.clone(),
                    position,
                )
            }
            BinlogEvent::Rows(rows) => {
                let checkpoint = self.at(self.group_start.unwrap_or(start));
                let resume_after = if rows.is_statement_end() {
                    self.group_start = None;
                    self.safe = self.at(end);
                    self.safe.clone()
                } else {
                    checkpoint.clone()
                };
                (rows.body, checkpoint, resume_after)
            }
            _ => {
                let heartbeat = matches!(
                    header.event_type,
                    EventType::HeartbeatEvent | EventType::HeartbeatEventV2
                );
                if !artificial && !heartbeat && self.group_start.is_none() {
                    self.safe = self.at(end);
                }
                let position = match self.group_start {
                    Some(group) => self.at(group),
                    None => self.safe.clone(),
                };
                (
                    NotificationBody::Other(header.event_type),
                    position.clone(),
                    position,
                )
            }
        };

        RawNotification {
            header,
            body,
            checkpoint,
            resume_after,
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let socket = self.channel.shutdown().await;
        if let Some(schema) = self.schema.take() {
            if let Err(e) = schema.close().await {
                warn!("Admin connection did not close cleanly: {}", e);
            }
        }
        debug!(events = self.events_read, "Binlog connection closed");
        socket
    }
}

#[async_trait]
impl<S> NotificationStream for BinlogClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_notification(&mut self) -> Result<Option<RawNotification>> {
        self.read_notification().await
    }

    async fn close(&mut self) -> Result<()> {
        self.shutdown().await
    }
}
