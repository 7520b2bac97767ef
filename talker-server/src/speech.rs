//! Speech relay: the canonical broadcast consumer.
//!
//! Utterances travel the mesh as `SPEECH` datagrams with a
//! `<speaker>|<utterance>` payload. On notification the observer writes the
//! formatted line to every local client. The speaking client sees its own
//! line exactly once: a locally-originated broadcast notifies observers
//! before it touches any peer link, and the dedup cache swallows echoes.

use std::sync::Arc;

use crate::observer::{MeshObserver, ObserverCtx, PeerInfo};
use crate::server::SharedState;
use crate::wire::MeshDatagram;

pub const SPEECH: &str = "SPEECH";

/// Build the wire payload for one utterance.
pub fn speech_payload(speaker: &str, utterance: &str) -> Vec<u8> {
    format!("{speaker}|{utterance}").into_bytes()
}

pub struct SpeechObserver {
    state: Arc<SharedState>,
}

impl SpeechObserver {
    pub fn new(state: Arc<SharedState>) -> Self {
        Self { state }
    }
}

impl MeshObserver for SpeechObserver {
    fn interests(&self) -> &[&'static str] {
        &[SPEECH]
    }

    fn on_datagram(
        &mut self,
        _ctx: &mut ObserverCtx<'_>,
        _from: Option<&PeerInfo>,
        datagram: &MeshDatagram,
    ) {
        let text = String::from_utf8_lossy(&datagram.payload);
        let Some((speaker, utterance)) = text.split_once('|') else {
            tracing::warn!(origin = %datagram.id.origin, "SPEECH payload without speaker, dropping");
            return;
        };
        self.state.tell_speakers(&format!("{speaker} says: {utterance}"));
    }
}
