//! In-process loopback channel service.
//!
//! Keeps plaintext envelopes per channel and enforces the service rules the
//! adapter depends on: an open session, channel membership, blob size limits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use unichat_core::Attachment;

use crate::client::{Envelope, FetchRange, SecureChannelInfo, SecureClient, StoredBlob};
use crate::error::SecureError;

/// Largest blob the loopback service stores.
pub const MAX_BLOB_SIZE: u64 = 10 * 1024 * 1024;

struct ChannelState {
    info: SecureChannelInfo,
    envelopes: Vec<Envelope>,
    acknowledged: HashMap<String, Vec<String>>,
}

#[derive(Default)]
struct ServiceState {
    channels: HashMap<String, ChannelState>,
    blobs: HashMap<String, Vec<u8>>,
}

pub struct MemorySecure {
    member: String,
    session: AtomicBool,
    state: Arc<Mutex<ServiceState>>,
    failures: Mutex<VecDeque<SecureError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemorySecure {
    pub fn new(member: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            session: AtomicBool::new(false),
            state: Arc::new(Mutex::new(ServiceState::default())),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Another member's device on the same service.
    pub fn sharing(other: &MemorySecure, member: impl Into<String>) -> Self {
        Self {
            state: Arc::clone(&other.state),
            ..Self::new(member)
        }
    }

    pub fn fail_next(&self, err: SecureError) {
        lock(&self.failures).push_back(err);
    }

    /// Envelope ids `member` acknowledged in `channel_id`.
    pub fn acknowledged(&self, channel_id: &str, member: &str) -> Vec<String> {
        lock(&self.state)
            .channels
            .get(channel_id)
            .and_then(|c| c.acknowledged.get(member).cloned())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<(), SecureError> {
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        if !self.session.load(Ordering::SeqCst) {
            return Err(SecureError::NoSession);
        }
        Ok(())
    }

    /// Run `f` on a channel the local member belongs to.
    fn with_channel<T>(
        &self,
        channel_id: &str,
        f: impl FnOnce(&mut ChannelState) -> Result<T, SecureError>,
    ) -> Result<T, SecureError> {
        self.check()?;
        let mut state = lock(&self.state);
        let channel = state
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| SecureError::ChannelNotFound(channel_id.to_string()))?;
        if !channel.info.members.contains(&self.member) {
            return Err(SecureError::NotMember {
                channel: channel_id.to_string(),
                member: self.member.clone(),
            });
        }
        f(channel)
    }
}

#[async_trait]
impl SecureClient for MemorySecure {
    fn local_member(&self) -> &str {
        &self.member
    }

    async fn open_session(&self) -> Result<(), SecureError> {
        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }
        self.session.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close_session(&self) -> Result<(), SecureError> {
        self.session.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn post(
        &self,
        channel_id: &str,
        plaintext: &str,
        reply_to: Option<&str>,
        attachments: &[Attachment],
    ) -> Result<Envelope, SecureError> {
        self.with_channel(channel_id, |channel| {
            if let Some(parent) = reply_to {
                if !channel.envelopes.iter().any(|e| e.id == parent) {
                    return Err(SecureError::EnvelopeNotFound(parent.to_string()));
                }
            }
            let envelope = Envelope {
                id: Uuid::new_v4().to_string(),
                channel_id: channel_id.to_string(),
                sender: self.member.clone(),
                seq: channel.envelopes.last().map_or(1, |e| e.seq + 1),
                sent_at: Utc::now(),
                plaintext: plaintext.to_string(),
                reply_to: reply_to.map(str::to_string),
                attachments: attachments.to_vec(),
            };
            channel.envelopes.push(envelope.clone());
            Ok(envelope)
        })
    }

    async fn fetch(
        &self,
        channel_id: &str,
        range: FetchRange,
        limit: usize,
    ) -> Result<Vec<Envelope>, SecureError> {
        self.with_channel(channel_id, |channel| {
            let envelopes = &channel.envelopes;
            let window: &[Envelope] = match range {
                FetchRange::Latest => envelopes,
                FetchRange::Before(id) => {
                    let cut = envelopes
                        .iter()
                        .position(|e| e.id == id)
                        .ok_or(SecureError::EnvelopeNotFound(id))?;
                    &envelopes[..cut]
                }
                FetchRange::After(cursor) => {
                    let start = envelopes.partition_point(|e| e.seq <= cursor);
                    let end = envelopes.len().min(start + limit);
                    return Ok(envelopes[start..end].to_vec());
                }
            };
            let skip = window.len().saturating_sub(limit);
            Ok(window[skip..].to_vec())
        })
    }

    async fn create_channel(
        &self,
        label: &str,
        name: &str,
        members: &[String],
    ) -> Result<SecureChannelInfo, SecureError> {
        self.check()?;
        let mut all = vec![self.member.clone()];
        for member in members {
            if !all.contains(member) {
                all.push(member.clone());
            }
        }
        let info = SecureChannelInfo {
            id: Uuid::new_v4().simple().to_string(),
            label: label.to_string(),
            name: name.to_string(),
            owner: self.member.clone(),
            members: all,
            created_at: Utc::now(),
        };
        lock(&self.state).channels.insert(
            info.id.clone(),
            ChannelState {
                info: info.clone(),
                envelopes: Vec::new(),
                acknowledged: HashMap::new(),
            },
        );
        Ok(info)
    }

    async fn channel(&self, channel_id: &str) -> Result<SecureChannelInfo, SecureError> {
        self.with_channel(channel_id, |channel| Ok(channel.info.clone()))
    }

    async fn channels(&self) -> Result<Vec<SecureChannelInfo>, SecureError> {
        self.check()?;
        let mut infos: Vec<SecureChannelInfo> = lock(&self.state)
            .channels
            .values()
            .filter(|c| c.info.members.contains(&self.member))
            .map(|c| c.info.clone())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(infos)
    }

    async fn add_member(&self, channel_id: &str, member: &str) -> Result<(), SecureError> {
        self.with_channel(channel_id, |channel| {
            if !channel.info.members.iter().any(|m| m == member) {
                channel.info.members.push(member.to_string());
            }
            Ok(())
        })
    }

    async fn remove_member(&self, channel_id: &str, member: &str) -> Result<(), SecureError> {
        self.with_channel(channel_id, |channel| {
            if member != self.member && channel.info.owner != self.member {
                return Err(SecureError::Status {
                    status: 403,
                    body: "forbidden: only the owner removes members".to_string(),
                });
            }
            let before = channel.info.members.len();
            channel.info.members.retain(|m| m != member);
            if channel.info.members.len() == before {
                return Err(SecureError::MemberNotFound(member.to_string()));
            }
            Ok(())
        })
    }

    async fn members(&self, channel_id: &str) -> Result<Vec<String>, SecureError> {
        self.with_channel(channel_id, |channel| Ok(channel.info.members.clone()))
    }

    async fn upload(
        &self,
        name: &str,
        _mime_type: &str,
        bytes: &[u8],
    ) -> Result<StoredBlob, SecureError> {
        self.check()?;
        let size = bytes.len() as u64;
        if size > MAX_BLOB_SIZE {
            return Err(SecureError::TooLarge {
                size,
                max: MAX_BLOB_SIZE,
            });
        }
        let id = Uuid::new_v4().simple().to_string();
        lock(&self.state).blobs.insert(id.clone(), bytes.to_vec());
        Ok(StoredBlob {
            url: format!("secure://blobs/{}/{}", id, name),
            id,
        })
    }

    async fn acknowledge(
        &self,
        channel_id: &str,
        envelope_ids: &[String],
    ) -> Result<(), SecureError> {
        self.with_channel(channel_id, |channel| {
            channel
                .acknowledged
                .entry(self.member.clone())
                .or_default()
                .extend(envelope_ids.iter().cloned());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(member: &str) -> MemorySecure {
        let client = MemorySecure::new(member);
        client.open_session().await.unwrap();
        client
    }

    #[tokio::test]
    async fn fetch_ranges_slice_by_sequence() {
        let alice = open("alice").await;
        let channel = alice.create_channel("direct", "dm", &[]).await.unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let env = alice
                .post(&channel.id, &format!("m{}", i), None, &[])
                .await
                .unwrap();
            assert_eq!(env.seq, i + 1);
            ids.push(env.id);
        }

        let latest = alice.fetch(&channel.id, FetchRange::Latest, 2).await.unwrap();
        assert_eq!(latest[0].plaintext, "m3");
        assert_eq!(latest[1].plaintext, "m4");

        let before = alice
            .fetch(&channel.id, FetchRange::Before(ids[2].clone()), 10)
            .await
            .unwrap();
        assert_eq!(before.len(), 2);

        let after = alice.fetch(&channel.id, FetchRange::After(3), 1).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].seq, 4);
    }

    #[tokio::test]
    async fn non_members_are_refused() {
        let alice = open("alice").await;
        let mallory = MemorySecure::sharing(&alice, "mallory");
        mallory.open_session().await.unwrap();
        let channel = alice.create_channel("direct", "dm", &[]).await.unwrap();

        let err = mallory
            .post(&channel.id, "hi", None, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SecureError::NotMember { .. }));
        assert!(mallory.channels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_is_required() {
        let client = MemorySecure::new("alice");
        assert!(matches!(
            client.channels().await,
            Err(SecureError::NoSession)
        ));
    }

    #[tokio::test]
    async fn oversized_blobs_are_rejected() {
        let client = open("alice").await;
        let big = vec![0u8; (MAX_BLOB_SIZE + 1) as usize];
        assert!(matches!(
            client.upload("big.bin", "application/octet-stream", &big).await,
            Err(SecureError::TooLarge { .. })
        ));
        let blob = client.upload("a.txt", "text/plain", b"hi").await.unwrap();
        assert!(blob.url.ends_with("/a.txt"));
    }
}
