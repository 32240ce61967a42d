//! webrtc-rs implementation of the peer connection seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use duet_proto::{IceCandidate, SdpKind, SessionDescription};
use tokio::sync::Notify;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    ChannelEvent, ChannelInstance, ChannelPayload, ConnectionState, DataChannel,
    IceConnectionState, MediaPlan, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, TrackPlan, TransportError, next_channel_instance, to_setup_error,
};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct WebRtcFactory {
    api: API,
    configuration: RTCConfiguration,
    low_threshold: usize,
}

impl WebRtcFactory {
    /// `low_threshold` is the buffered amount below which channels report
    /// that their send buffer drained.
    pub fn new(ice_servers: &[String], low_threshold: usize) -> Result<Self, TransportError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let configuration = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        Ok(Self {
            api: build_api(setting)?,
            configuration,
            low_threshold,
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration.clone())
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = sink.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "duet::webrtc", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let state_sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "duet::webrtc", ?state, "peer connection state changed");
                let _ = sink.send(PeerEvent::ConnectionState(map_connection_state(state)));
            })
        }));

        let ice_sink = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let sink = ice_sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "duet::webrtc", ?state, "ice connection state changed");
                let _ = sink.send(PeerEvent::IceState(map_ice_state(state)));
            })
        }));

        let channel_sink = events.clone();
        let low_threshold = self.low_threshold;
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = channel_sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "duet::webrtc", label = dc.label(), "remote data channel announced");
                let channel = WebRtcDataChannel::wrap(dc, sink.clone(), low_threshold).await;
                let _ = sink.send(PeerEvent::RemoteChannel(channel));
            })
        }));

        Ok(Arc::new(WebRtcPeerConnection {
            pc,
            events,
            low_threshold: self.low_threshold,
        }))
    }
}

pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSink,
    low_threshold: usize,
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            voice_activity_detection: false,
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(to_setup_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(to_setup_error)?;
        tracing::trace!(target = "duet::webrtc", ice_restart, "local offer installed");
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_setup_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(to_setup_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(to_setup_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_setup_error)
    }

    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        Ok(WebRtcDataChannel::wrap(dc, self.events.clone(), self.low_threshold).await)
    }

    async fn add_media(&self, plan: MediaPlan) -> Result<(), TransportError> {
        add_track(&self.pc, RTPCodecType::Audio, plan.audio).await?;
        add_track(&self.pc, RTPCodecType::Video, plan.video).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

async fn add_track(
    pc: &Arc<RTCPeerConnection>,
    kind: RTPCodecType,
    plan: TrackPlan,
) -> Result<(), TransportError> {
    match plan {
        TrackPlan::ReceiveOnly => {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map_err(to_setup_error)?;
        }
        TrackPlan::Send => {
            let (mime_type, id) = match kind {
                RTPCodecType::Video => (MIME_TYPE_VP8, "video"),
                _ => (MIME_TYPE_OPUS, "audio"),
            };
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                id.to_owned(),
                "duet".to_owned(),
            ));
            pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(to_setup_error)?;
        }
    }
    Ok(())
}

pub struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    instance: ChannelInstance,
    drained: Arc<Notify>,
}

impl WebRtcDataChannel {
    /// Registers every handler before handing the channel out.
    async fn wrap(
        dc: Arc<RTCDataChannel>,
        events: PeerEventSink,
        low_threshold: usize,
    ) -> Arc<dyn DataChannel> {
        let label = dc.label().to_string();
        let instance = next_channel_instance();

        let open_sink = events.clone();
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            let sink = open_sink.clone();
            let label = open_label.clone();
            Box::pin(async move {
                tracing::debug!(target = "duet::webrtc", %label, "data channel open");
                let _ = sink.send(PeerEvent::Channel {
                    label,
                    instance,
                    event: ChannelEvent::Open,
                });
            })
        }));

        let close_sink = events.clone();
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            let sink = close_sink.clone();
            let label = close_label.clone();
            Box::pin(async move {
                tracing::debug!(target = "duet::webrtc", %label, "data channel closed");
                let _ = sink.send(PeerEvent::Channel {
                    label,
                    instance,
                    event: ChannelEvent::Close,
                });
            })
        }));

        let message_sink = events;
        let message_label = label.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = message_sink.clone();
            let label = message_label.clone();
            Box::pin(async move {
                let payload = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => ChannelPayload::Text(text),
                        Err(_) => {
                            tracing::warn!(target = "duet::webrtc", %label, "dropping non-utf8 text frame");
                            return;
                        }
                    }
                } else {
                    ChannelPayload::Binary(msg.data)
                };
                let _ = sink.send(PeerEvent::Channel {
                    label,
                    instance,
                    event: ChannelEvent::Message(payload),
                });
            })
        }));

        let drained = Arc::new(Notify::new());
        dc.set_buffered_amount_low_threshold(low_threshold).await;
        let drained_signal = Arc::clone(&drained);
        dc.on_buffered_amount_low(Box::new(move || {
            let drained = Arc::clone(&drained_signal);
            Box::pin(async move {
                drained.notify_waiters();
            })
        }))
        .await;

        Arc::new(Self {
            dc,
            label,
            instance,
            drained,
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn instance(&self) -> ChannelInstance {
        self.instance
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        tokio::time::timeout(SEND_TIMEOUT, self.dc.send_text(text.to_string()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|err| {
                tracing::warn!(target = "duet::webrtc", label = %self.label, error = %err, "webrtc send error");
                TransportError::ChannelClosed
            })?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        tokio::time::timeout(SEND_TIMEOUT, self.dc.send(&data))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|err| {
                tracing::warn!(target = "duet::webrtc", label = %self.label, error = %err, "webrtc send error");
                TransportError::ChannelClosed
            })?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn buffer_drained(&self) -> Option<Arc<Notify>> {
        Some(Arc::clone(&self.drained))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc.close().await.map_err(to_setup_error)
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let SessionDescription { kind, sdp } = description;
    match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp).map_err(to_setup_error),
        SdpKind::Answer => RTCSessionDescription::answer(sdp).map_err(to_setup_error),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp).map_err(to_setup_error),
        SdpKind::Rollback => Err(TransportError::InvalidState(
            "rollback is not a remote description".into(),
        )),
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn maps_terminal_states() {
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert!(map_ice_state(RTCIceConnectionState::Completed).is_connected());
        assert!(!map_ice_state(RTCIceConnectionState::Disconnected).is_connected());
    }

    #[test_timeout::timeout]
    fn rollback_is_never_applied_remotely() {
        let description = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(
            to_rtc_description(description),
            Err(TransportError::InvalidState(_))
        ));
    }
}
