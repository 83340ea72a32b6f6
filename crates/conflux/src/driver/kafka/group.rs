//! Consumer-group coordination
//!
//! rskafka covers produce, fetch and metadata but has no group coordinator
//! API, so membership and offset storage are spoken here directly with the
//! message types of the `kafka-protocol` crate:
//!
//! | API | Version | Use |
//! |-----|---------|-----|
//! | FindCoordinator | 2 | locate the group coordinator |
//! | JoinGroup / SyncGroup | 5 / 3 | membership and range assignment |
//! | Heartbeat | 1 | keep membership alive, detect rebalances |
//! | LeaveGroup | 1 | hand partitions back on close |
//! | OffsetCommit / OffsetFetch | 2 / 3 | durable group offsets |
//! | SaslHandshake / SaslAuthenticate | 1 / 0 | SASL PLAIN |
//!
//! A rebalance is not handled in place: the membership is marked lost and
//! the consumer reports a disconnect, so the runtime reconnects and the new
//! session joins the next generation.

use super::assignment::{range_assign, Assignment, Subscription, PROTOCOL_TYPE, RANGE};
use crate::config::SaslSettings;
use crate::driver::{DriverError, DriverResult};
use crate::envelope::CommitOffset;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use kafka_protocol::messages::find_coordinator_request::FindCoordinatorRequest;
use kafka_protocol::messages::heartbeat_request::HeartbeatRequest;
use kafka_protocol::messages::join_group_request::{JoinGroupRequest, JoinGroupRequestProtocol};
use kafka_protocol::messages::leave_group_request::LeaveGroupRequest;
use kafka_protocol::messages::offset_commit_request::{
    OffsetCommitRequest, OffsetCommitRequestPartition, OffsetCommitRequestTopic,
};
use kafka_protocol::messages::offset_fetch_request::{OffsetFetchRequest, OffsetFetchRequestTopic};
use kafka_protocol::messages::sasl_authenticate_request::SaslAuthenticateRequest;
use kafka_protocol::messages::sasl_handshake_request::SaslHandshakeRequest;
use kafka_protocol::messages::sync_group_request::{SyncGroupRequest, SyncGroupRequestAssignment};
use kafka_protocol::messages::{GroupId, RequestHeader, ResponseHeader, TopicName};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, Request, StrBytes};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) const ERROR_NONE: i16 = 0;
pub(crate) const ERROR_COORDINATOR_LOAD_IN_PROGRESS: i16 = 14;
pub(crate) const ERROR_COORDINATOR_NOT_AVAILABLE: i16 = 15;
pub(crate) const ERROR_NOT_COORDINATOR: i16 = 16;
pub(crate) const ERROR_ILLEGAL_GENERATION: i16 = 22;
pub(crate) const ERROR_UNKNOWN_MEMBER_ID: i16 = 25;
pub(crate) const ERROR_REBALANCE_IN_PROGRESS: i16 = 27;
pub(crate) const ERROR_MEMBER_ID_REQUIRED: i16 = 79;

const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const JOIN_ATTEMPTS: usize = 10;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Membership timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupTimeouts {
    pub session: Duration,
    pub rebalance: Duration,
    pub heartbeat: Duration,
}

impl Default for GroupTimeouts {
    fn default() -> Self {
        Self {
            session: Duration::from_secs(10),
            rebalance: Duration::from_secs(30),
            heartbeat: Duration::from_secs(3),
        }
    }
}

impl GroupTimeouts {
    /// Upper bound for one request; JoinGroup may be parked for a whole rebalance
    fn request(&self) -> Duration {
        self.rebalance + Duration::from_secs(5)
    }
}

fn codec_err(e: impl Display) -> DriverError {
    DriverError::request(format!("protocol codec: {}", e))
}

fn io_err(address: &str, e: impl Display) -> DriverError {
    DriverError::Disconnected(format!("{}: {}", address, e))
}

/// Error codes that mean this member's generation is over
fn is_membership_error(code: i16) -> bool {
    matches!(
        code,
        ERROR_ILLEGAL_GENERATION
            | ERROR_UNKNOWN_MEMBER_ID
            | ERROR_REBALANCE_IN_PROGRESS
            | ERROR_NOT_COORDINATOR
            | ERROR_COORDINATOR_NOT_AVAILABLE
    )
}

fn str_bytes(s: &str) -> StrBytes {
    StrBytes::from_string(s.to_string())
}

/// One request/response connection to a broker
pub(crate) struct BrokerConnection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    address: String,
    client_id: String,
    correlation_id: i32,
    request_timeout: Duration,
}

impl BrokerConnection {
    pub async fn connect(
        address: &str,
        client_id: &str,
        sasl: Option<&SaslSettings>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> DriverResult<Self> {
        let socket = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                DriverError::connect(format!(
                    "connection timeout after {}ms to {}",
                    connect_timeout.as_millis(),
                    address
                ))
            })?
            .map_err(|e| DriverError::connect(format!("{}: {}", address, e)))?;

        let codec = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();

        let mut conn = Self {
            framed: Framed::new(socket, codec),
            address: address.to_string(),
            client_id: client_id.to_string(),
            correlation_id: 0,
            request_timeout,
        };
        if let Some(sasl) = sasl {
            conn.authenticate(sasl).await?;
        }
        Ok(conn)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one request and wait for its response
    pub async fn call<R: Request>(&mut self, version: i16, request: R) -> DriverResult<R::Response> {
        self.correlation_id = self.correlation_id.wrapping_add(1);
        let correlation_id = self.correlation_id;

        let header = RequestHeader::default()
            .with_request_api_key(R::KEY)
            .with_request_api_version(version)
            .with_correlation_id(correlation_id)
            .with_client_id(Some(str_bytes(&self.client_id)));

        let mut buf = BytesMut::new();
        header
            .encode(&mut buf, R::header_version(version))
            .map_err(codec_err)?;
        request.encode(&mut buf, version).map_err(codec_err)?;

        let address = self.address.as_str();
        let framed = &mut self.framed;
        let exchange = async {
            framed.send(buf.freeze()).await.map_err(|e| io_err(address, e))?;
            match framed.next().await {
                Some(Ok(frame)) => Ok::<BytesMut, DriverError>(frame),
                Some(Err(e)) => Err(io_err(address, e)),
                None => Err(io_err(address, "connection closed by broker")),
            }
        };
        let mut frame = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| io_err(address, "request timed out"))??;

        let response_header = ResponseHeader::decode(&mut frame, R::Response::header_version(version))
            .map_err(codec_err)?;
        if response_header.correlation_id != correlation_id {
            return Err(DriverError::request(format!(
                "correlation id mismatch from {}: sent {}, got {}",
                self.address, correlation_id, response_header.correlation_id
            )));
        }
        R::Response::decode(&mut frame, version).map_err(codec_err)
    }

    /// SASL PLAIN. SCRAM mechanisms are answered with PLAIN, matching the
    /// data-plane client.
    async fn authenticate(&mut self, sasl: &SaslSettings) -> DriverResult<()> {
        let handshake = SaslHandshakeRequest::default().with_mechanism(str_bytes("PLAIN"));
        let response = self.call(1, handshake).await?;
        if response.error_code != ERROR_NONE {
            return Err(DriverError::connect(format!(
                "{} rejected SASL PLAIN (error {}), enabled mechanisms: {:?}",
                self.address,
                response.error_code,
                response.mechanisms.iter().map(|m| m.to_string()).collect::<Vec<_>>()
            )));
        }

        let mut token = Vec::new();
        token.push(0);
        token.extend_from_slice(sasl.username.as_bytes());
        token.push(0);
        token.extend_from_slice(sasl.password.expose_secret().as_bytes());
        let auth = SaslAuthenticateRequest::default().with_auth_bytes(Bytes::from(token));
        let response = self.call(0, auth).await?;
        if response.error_code != ERROR_NONE {
            return Err(DriverError::connect(format!(
                "SASL authentication failed at {}: {}",
                self.address,
                response
                    .error_message
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("error {}", response.error_code))
            )));
        }
        debug!(address = %self.address, "SASL authenticated");
        Ok(())
    }
}

/// Connection parameters shared by every coordinator lookup
#[derive(Debug, Clone)]
pub(crate) struct CoordinatorConfig {
    pub brokers: Vec<String>,
    pub client_id: String,
    pub group_id: String,
    pub sasl: Option<SaslSettings>,
    pub connect_timeout: Duration,
    pub timeouts: GroupTimeouts,
}

impl CoordinatorConfig {
    async fn connect(&self, address: &str) -> DriverResult<BrokerConnection> {
        BrokerConnection::connect(
            address,
            &self.client_id,
            self.sasl.as_ref(),
            self.connect_timeout,
            self.timeouts.request(),
        )
        .await
    }

    /// Ask the bootstrap brokers, in order, for the group coordinator and
    /// connect to it
    pub async fn find_coordinator(&self) -> DriverResult<BrokerConnection> {
        let mut last_error = DriverError::connect("no bootstrap servers configured");

        for bootstrap in &self.brokers {
            let mut conn = match self.connect(bootstrap).await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(broker = %bootstrap, error = %e, "Bootstrap broker unreachable");
                    last_error = e;
                    continue;
                }
            };

            for _ in 0..JOIN_ATTEMPTS {
                let request = FindCoordinatorRequest::default()
                    .with_key(str_bytes(&self.group_id))
                    .with_key_type(0);
                let response = conn.call(2, request).await?;
                match response.error_code {
                    ERROR_NONE => {
                        let address = format!("{}:{}", response.host, response.port);
                        debug!(group = %self.group_id, coordinator = %address, "Found group coordinator");
                        if address == conn.address() {
                            return Ok(conn);
                        }
                        return self.connect(&address).await;
                    }
                    ERROR_COORDINATOR_NOT_AVAILABLE | ERROR_COORDINATOR_LOAD_IN_PROGRESS => {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                    code => {
                        return Err(DriverError::connect(format!(
                            "FindCoordinator for group '{}' failed with error {}",
                            self.group_id, code
                        )))
                    }
                }
            }
            last_error = DriverError::connect(format!(
                "coordinator for group '{}' not available",
                self.group_id
            ));
        }

        Err(last_error)
    }
}

/// Membership of one generation of the group
pub(crate) struct GroupMember {
    conn: Arc<tokio::sync::Mutex<BrokerConnection>>,
    group_id: String,
    member_id: String,
    generation_id: i32,
    assignment: Assignment,
    lost: Arc<Mutex<Option<String>>>,
    heartbeat: CancellationToken,
}

impl GroupMember {
    /// Join the group and take this member's partitions.
    ///
    /// `cluster` lists the partitions of every topic; the leader needs it to
    /// assign topics other members subscribed to.
    pub async fn join(
        config: &CoordinatorConfig,
        subscription: &Subscription,
        cluster: &HashMap<String, Vec<i32>>,
    ) -> DriverResult<Self> {
        let mut conn = config.find_coordinator().await?;
        let mut member_id = String::new();

        for attempt in 1..=JOIN_ATTEMPTS {
            let mut request = JoinGroupRequest::default();
            request.group_id = GroupId(str_bytes(&config.group_id));
            request.session_timeout_ms = config.timeouts.session.as_millis() as i32;
            request.rebalance_timeout_ms = config.timeouts.rebalance.as_millis() as i32;
            request.member_id = str_bytes(&member_id);
            request.protocol_type = str_bytes(PROTOCOL_TYPE);
            request.protocols = vec![JoinGroupRequestProtocol::default()
                .with_name(str_bytes(RANGE))
                .with_metadata(Bytes::from(subscription.encode()))];

            let joined = conn.call(5, request).await?;
            match joined.error_code {
                ERROR_NONE => {}
                ERROR_MEMBER_ID_REQUIRED => {
                    member_id = joined.member_id.to_string();
                    continue;
                }
                ERROR_UNKNOWN_MEMBER_ID => {
                    member_id.clear();
                    continue;
                }
                ERROR_REBALANCE_IN_PROGRESS | ERROR_COORDINATOR_LOAD_IN_PROGRESS => {
                    debug!(group = %config.group_id, attempt, "Group busy, retrying join");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    continue;
                }
                code => {
                    return Err(DriverError::connect(format!(
                        "JoinGroup for group '{}' failed with error {}",
                        config.group_id, code
                    )))
                }
            }

            member_id = joined.member_id.to_string();
            let generation_id = joined.generation_id;
            let is_leader = &*joined.leader == member_id.as_str();

            let assignments = if is_leader {
                let members = joined
                    .members
                    .iter()
                    .map(|m| Ok((m.member_id.to_string(), Subscription::parse(&m.metadata)?)))
                    .collect::<DriverResult<Vec<_>>>()?;
                range_assign(&members, cluster)
                    .into_iter()
                    .map(|(id, assignment)| {
                        SyncGroupRequestAssignment::default()
                            .with_member_id(str_bytes(&id))
                            .with_assignment(Bytes::from(assignment.encode()))
                    })
                    .collect()
            } else {
                Vec::new()
            };

            let mut sync = SyncGroupRequest::default();
            sync.group_id = GroupId(str_bytes(&config.group_id));
            sync.generation_id = generation_id;
            sync.member_id = str_bytes(&member_id);
            sync.assignments = assignments;

            let synced = conn.call(3, sync).await?;
            match synced.error_code {
                ERROR_NONE => {}
                ERROR_REBALANCE_IN_PROGRESS | ERROR_ILLEGAL_GENERATION => {
                    debug!(group = %config.group_id, generation_id, "Rebalance during sync, rejoining");
                    continue;
                }
                ERROR_UNKNOWN_MEMBER_ID => {
                    member_id.clear();
                    continue;
                }
                code => {
                    return Err(DriverError::connect(format!(
                        "SyncGroup for group '{}' failed with error {}",
                        config.group_id, code
                    )))
                }
            }

            let assignment = Assignment::parse(&synced.assignment)?;
            info!(
                group = %config.group_id,
                member = %member_id,
                generation_id,
                leader = is_leader,
                partitions = assignment.len(),
                "Joined consumer group"
            );

            let member = Self {
                conn: Arc::new(tokio::sync::Mutex::new(conn)),
                group_id: config.group_id.clone(),
                member_id,
                generation_id,
                assignment,
                lost: Arc::default(),
                heartbeat: CancellationToken::new(),
            };
            member.spawn_heartbeat(config.timeouts.heartbeat);
            return Ok(member);
        }

        Err(DriverError::connect(format!(
            "could not join group '{}' after {} attempts",
            config.group_id, JOIN_ATTEMPTS
        )))
    }

    fn spawn_heartbeat(&self, interval: Duration) {
        let conn = Arc::clone(&self.conn);
        let lost = Arc::clone(&self.lost);
        let cancel = self.heartbeat.clone();
        let group_id = self.group_id.clone();
        let member_id = self.member_id.clone();
        let generation_id = self.generation_id;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let mut request = HeartbeatRequest::default();
                request.group_id = GroupId(str_bytes(&group_id));
                request.generation_id = generation_id;
                request.member_id = str_bytes(&member_id);

                let result = conn.lock().await.call(1, request).await;
                let reason = match result {
                    Ok(response) if response.error_code == ERROR_NONE => continue,
                    Ok(response) => format!("heartbeat returned error {}", response.error_code),
                    Err(e) => format!("heartbeat failed: {}", e),
                };
                warn!(group = %group_id, generation_id, reason = %reason, "Group membership lost");
                *lost.lock() = Some(reason);
                return;
            }
        });
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn generation_id(&self) -> i32 {
        self.generation_id
    }

    /// Why this generation ended, once it has
    pub fn lost(&self) -> Option<String> {
        self.lost.lock().clone()
    }

    fn mark_lost(&self, reason: String) -> DriverError {
        *self.lost.lock() = Some(reason.clone());
        DriverError::Disconnected(reason)
    }

    /// Committed offsets of the assigned partitions. Partitions without a
    /// commit are absent.
    pub async fn fetch_committed(&self) -> DriverResult<HashMap<(String, i32), i64>> {
        let mut request = OffsetFetchRequest::default();
        request.group_id = GroupId(str_bytes(&self.group_id));
        request.topics = Some(
            self.assignment
                .partitions
                .iter()
                .map(|(topic, partitions)| {
                    OffsetFetchRequestTopic::default()
                        .with_name(TopicName(str_bytes(topic)))
                        .with_partition_indexes(partitions.clone())
                })
                .collect(),
        );

        let response = self.conn.lock().await.call(3, request).await?;
        if response.error_code != ERROR_NONE {
            return Err(DriverError::request(format!(
                "OffsetFetch for group '{}' failed with error {}",
                self.group_id, response.error_code
            )));
        }

        let mut committed = HashMap::new();
        for topic in response.topics {
            for partition in topic.partitions {
                if partition.error_code != ERROR_NONE {
                    warn!(
                        topic = %topic.name.0,
                        partition = partition.partition_index,
                        error_code = partition.error_code,
                        "Committed offset unavailable"
                    );
                    continue;
                }
                if partition.committed_offset >= 0 {
                    committed.insert(
                        (topic.name.0.to_string(), partition.partition_index),
                        partition.committed_offset,
                    );
                }
            }
        }
        Ok(committed)
    }

    /// Commit offsets for this generation. A generation error ends the
    /// membership and is reported as a disconnect.
    pub async fn commit(&self, offsets: &[CommitOffset]) -> DriverResult<()> {
        if let Some(reason) = self.lost() {
            return Err(DriverError::Disconnected(reason));
        }

        let mut by_topic: BTreeMap<&str, Vec<OffsetCommitRequestPartition>> = BTreeMap::new();
        for offset in offsets {
            by_topic.entry(offset.topic.as_str()).or_default().push(
                OffsetCommitRequestPartition::default()
                    .with_partition_index(offset.partition)
                    .with_committed_offset(offset.offset),
            );
        }

        let mut request = OffsetCommitRequest::default();
        request.group_id = GroupId(str_bytes(&self.group_id));
        request.generation_id_or_member_epoch = self.generation_id;
        request.member_id = str_bytes(&self.member_id);
        request.topics = by_topic
            .into_iter()
            .map(|(topic, partitions)| {
                OffsetCommitRequestTopic::default()
                    .with_name(TopicName(str_bytes(topic)))
                    .with_partitions(partitions)
            })
            .collect();

        let response = self.conn.lock().await.call(2, request).await?;
        for topic in response.topics {
            for partition in topic.partitions {
                match partition.error_code {
                    ERROR_NONE => {}
                    code if is_membership_error(code) => {
                        return Err(self.mark_lost(format!(
                            "commit rejected for generation {} (error {})",
                            self.generation_id, code
                        )));
                    }
                    code => {
                        return Err(DriverError::request(format!(
                            "OffsetCommit {}/{} failed with error {}",
                            topic.name.0, partition.partition_index, code
                        )));
                    }
                }
            }
        }
        debug!(group = %self.group_id, partitions = offsets.len(), "Committed offsets");
        Ok(())
    }

    /// Stop heartbeating and leave the group
    pub async fn leave(&self) {
        self.heartbeat.cancel();
        if self.lost().is_some() {
            return;
        }
        let mut request = LeaveGroupRequest::default();
        request.group_id = GroupId(str_bytes(&self.group_id));
        request.member_id = str_bytes(&self.member_id);
        match self.conn.lock().await.call(1, request).await {
            Ok(response) if response.error_code == ERROR_NONE => {
                debug!(group = %self.group_id, member = %self.member_id, "Left consumer group");
            }
            Ok(response) => {
                debug!(group = %self.group_id, error_code = response.error_code, "LeaveGroup rejected");
            }
            Err(e) => debug!(group = %self.group_id, error = %e, "LeaveGroup failed"),
        }
    }
}

impl Drop for GroupMember {
    fn drop(&mut self) {
        self.heartbeat.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::messages::find_coordinator_response::FindCoordinatorResponse;
    use kafka_protocol::messages::heartbeat_response::HeartbeatResponse;
    use kafka_protocol::messages::join_group_response::{JoinGroupResponse, JoinGroupResponseMember};
    use kafka_protocol::messages::leave_group_response::LeaveGroupResponse;
    use kafka_protocol::messages::offset_commit_response::{
        OffsetCommitResponse, OffsetCommitResponsePartition, OffsetCommitResponseTopic,
    };
    use kafka_protocol::messages::offset_fetch_response::{
        OffsetFetchResponse, OffsetFetchResponsePartition, OffsetFetchResponseTopic,
    };
    use kafka_protocol::messages::sync_group_response::SyncGroupResponse;
    use kafka_protocol::messages::ApiKey;
    use tokio::net::TcpListener;

    /// Group coordinator state held by the test broker
    #[derive(Default)]
    struct GroupState {
        joins: usize,
        subscription: Option<Subscription>,
        committed: HashMap<(String, i32), i64>,
        commit_generations: Vec<i32>,
        heartbeat_error: i16,
        left: bool,
    }

    /// Decode a request header, choosing the header version from the api key/version prefix
    fn decode_request_header_from_buffer(buf: &mut BytesMut) -> anyhow::Result<RequestHeader> {
        let api_key = ApiKey::try_from(i16::from_be_bytes([buf[0], buf[1]]))
            .map_err(|_| anyhow::anyhow!("unknown api key"))?;
        let api_version = i16::from_be_bytes([buf[2], buf[3]]);
        Ok(RequestHeader::decode(buf, api_key.request_header_version(api_version))?)
    }

    fn reply<R: Encodable + HeaderVersion>(correlation_id: i32, version: i16, body: R) -> Bytes {
        let mut buf = BytesMut::new();
        ResponseHeader::default()
            .with_correlation_id(correlation_id)
            .encode(&mut buf, R::header_version(version))
            .unwrap();
        body.encode(&mut buf, version).unwrap();
        buf.freeze()
    }

    fn handle(state: &Mutex<GroupState>, port: u16, mut frame: BytesMut) -> Bytes {
        let header = decode_request_header_from_buffer(&mut frame).unwrap();
        let version = header.request_api_version;
        let corr = header.correlation_id;
        let key = header.request_api_key;
        let mut state = state.lock();

        if key == FindCoordinatorRequest::KEY {
            let mut response = FindCoordinatorResponse::default();
            response.host = str_bytes("127.0.0.1");
            response.port = port as i32;
            reply(corr, version, response)
        } else if key == JoinGroupRequest::KEY {
            let request = JoinGroupRequest::decode(&mut frame, version).unwrap();
            state.joins += 1;
            let mut response = JoinGroupResponse::default();
            if request.member_id.is_empty() {
                response.error_code = ERROR_MEMBER_ID_REQUIRED;
                response.member_id = str_bytes("member-1");
                return reply(corr, version, response);
            }
            let metadata = request.protocols[0].metadata.clone();
            state.subscription = Some(Subscription::parse(&metadata).unwrap());
            response.generation_id = 4;
            response.protocol_name = Some(str_bytes(RANGE));
            response.leader = request.member_id.clone();
            response.member_id = request.member_id.clone();
            response.members = vec![JoinGroupResponseMember::default()
                .with_member_id(request.member_id)
                .with_metadata(metadata)];
            reply(corr, version, response)
        } else if key == SyncGroupRequest::KEY {
            let request = SyncGroupRequest::decode(&mut frame, version).unwrap();
            let mut response = SyncGroupResponse::default();
            response.assignment = request.assignments[0].assignment.clone();
            reply(corr, version, response)
        } else if key == HeartbeatRequest::KEY {
            let mut response = HeartbeatResponse::default();
            response.error_code = state.heartbeat_error;
            reply(corr, version, response)
        } else if key == OffsetCommitRequest::KEY {
            let request = OffsetCommitRequest::decode(&mut frame, version).unwrap();
            state.commit_generations.push(request.generation_id_or_member_epoch);
            let mut response = OffsetCommitResponse::default();
            for topic in request.topics {
                let mut partitions = Vec::new();
                for p in topic.partitions {
                    state
                        .committed
                        .insert((topic.name.0.to_string(), p.partition_index), p.committed_offset);
                    partitions.push(OffsetCommitResponsePartition::default().with_partition_index(p.partition_index));
                }
                response
                    .topics
                    .push(OffsetCommitResponseTopic::default().with_name(topic.name).with_partitions(partitions));
            }
            reply(corr, version, response)
        } else if key == OffsetFetchRequest::KEY {
            let request = OffsetFetchRequest::decode(&mut frame, version).unwrap();
            let mut response = OffsetFetchResponse::default();
            for topic in request.topics.unwrap_or_default() {
                let partitions = topic
                    .partition_indexes
                    .iter()
                    .map(|p| {
                        let offset = state
                            .committed
                            .get(&(topic.name.0.to_string(), *p))
                            .copied()
                            .unwrap_or(-1);
                        OffsetFetchResponsePartition::default()
                            .with_partition_index(*p)
                            .with_committed_offset(offset)
                    })
                    .collect();
                response
                    .topics
                    .push(OffsetFetchResponseTopic::default().with_name(topic.name).with_partitions(partitions));
            }
            reply(corr, version, response)
        } else if key == LeaveGroupRequest::KEY {
            state.left = true;
            reply(corr, version, LeaveGroupResponse::default())
        } else {
            panic!("unexpected api key {}", key);
        }
    }

    /// Single-node broker that is its own group coordinator
    async fn start_coordinator(state: Arc<Mutex<GroupState>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
                    while let Some(Ok(frame)) = framed.next().await {
                        let response = handle(&state, port, frame);
                        if framed.send(response).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        format!("127.0.0.1:{}", port)
    }

    fn config(address: String, heartbeat: Duration) -> CoordinatorConfig {
        CoordinatorConfig {
            brokers: vec![address],
            client_id: "conflux-test".into(),
            group_id: "orders-service".into(),
            sasl: None,
            connect_timeout: Duration::from_secs(2),
            timeouts: GroupTimeouts {
                heartbeat,
                ..GroupTimeouts::default()
            },
        }
    }

    #[tokio::test]
    async fn test_join_assigns_partitions_and_commits_durably() {
        let state = Arc::new(Mutex::new(GroupState::default()));
        let address = start_coordinator(Arc::clone(&state)).await;
        let config = config(address, Duration::from_secs(60));

        let cluster: HashMap<String, Vec<i32>> =
            [("orders".to_string(), vec![0, 1]), ("other".to_string(), vec![0])].into();
        let subscription = Subscription::new(["orders".to_string()]);

        let member = GroupMember::join(&config, &subscription, &cluster).await.unwrap();
        assert_eq!(member.generation_id(), 4);
        assert_eq!(member.assignment().partitions["orders"], vec![0, 1]);
        assert!(!member.assignment().partitions.contains_key("other"));
        assert!(member.fetch_committed().await.unwrap().is_empty());
        {
            let state = state.lock();
            // first join only collects the member id
            assert_eq!(state.joins, 2);
            assert_eq!(state.subscription.as_ref(), Some(&subscription));
        }

        member
            .commit(&[CommitOffset {
                topic: "orders".into(),
                partition: 1,
                offset: 12,
            }])
            .await
            .unwrap();
        assert_eq!(state.lock().commit_generations, vec![4]);
        member.leave().await;
        assert!(state.lock().left);

        // a later member of the same group resumes from the broker's record
        let next = GroupMember::join(&config, &subscription, &cluster).await.unwrap();
        let committed = next.fetch_committed().await.unwrap();
        assert_eq!(committed.get(&("orders".to_string(), 1)), Some(&12));
        assert_eq!(committed.get(&("orders".to_string(), 0)), None);
    }

    #[tokio::test]
    async fn test_rebalance_marks_membership_lost() {
        let state = Arc::new(Mutex::new(GroupState::default()));
        let address = start_coordinator(Arc::clone(&state)).await;
        let config = config(address, Duration::from_millis(20));

        let cluster: HashMap<String, Vec<i32>> = [("orders".to_string(), vec![0])].into();
        let member = GroupMember::join(&config, &Subscription::new(["orders".to_string()]), &cluster)
            .await
            .unwrap();
        assert!(member.lost().is_none());

        state.lock().heartbeat_error = ERROR_REBALANCE_IN_PROGRESS;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while member.lost().is_none() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(member.lost().unwrap().contains("27"));

        let err = member
            .commit(&[CommitOffset {
                topic: "orders".into(),
                partition: 0,
                offset: 1,
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Disconnected(_)));
        assert!(state.lock().committed.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_coordinator() {
        let config = config("127.0.0.1:1".to_string(), Duration::from_secs(1));
        let err = config.find_coordinator().await.err().unwrap();
        assert!(matches!(err, DriverError::Connect(_)));
    }
}
