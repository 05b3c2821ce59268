mod conflict;
mod error;
mod mutations;
mod queries;

pub use conflict::parse_span;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedUserState = Arc<RwLock<UserState>>;
pub type SharedMeetingState = Arc<RwLock<MeetingState>>;

/// Write guards for a set of users, held in ascending id order.
pub(super) type UserGuards = Vec<OwnedRwLockWriteGuard<UserState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        change: Change,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        changes: Vec<Change>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { change, response } => {
                let mut batch = vec![(change, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { change, response }) => {
                            batch.push((change, response));
                        }
                        Ok(other) => {
                            // Flush what we have before handling the non-append command
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Change, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} records failed: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

/// Commit the whole batch or none of it. Every caller in a failed batch is
/// told so, so no byte of that batch may survive on disk.
fn flush_batch(wal: &mut Wal, batch: &[(Change, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(change, _)| wal.append_buffered(change))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed, refusing further writes: {e}");
        }
    }
    result
}

fn respond_batch(batch: &mut Vec<(Change, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { changes, response } => {
            let result = Wal::write_compact_file(wal.path(), &changes)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Owns all scheduling and directory state for one data directory.
///
/// Lock order: `commit_gate` (shared, mutations only), then user locks in
/// ascending id order, then the meeting lock. Event and organization entries
/// are only touched through short DashMap borrows that never span an await.
pub struct Engine {
    pub(super) organizations: DashMap<Ulid, OrganizationState>,
    pub(super) events: DashMap<Ulid, EventState>,
    pub(super) users: DashMap<Ulid, SharedUserState>,
    pub(super) meetings: DashMap<Ulid, SharedMeetingState>,
    /// Reverse lookup: invitation id → meeting id
    pub(super) invitation_to_meeting: DashMap<Ulid, Ulid>,
    /// Ids claimed by a creation that has not committed yet.
    pub(super) ids_in_flight: DashMap<Ulid, ()>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss a concurrent commit.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    next_seq: AtomicU64,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> std::io::Result<Self> {
        let (wal, changes) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            organizations: DashMap::new(),
            events: DashMap::new(),
            users: DashMap::new(),
            meetings: DashMap::new(),
            invitation_to_meeting: DashMap::new(),
            ids_in_flight: DashMap::new(),
            commit_gate: RwLock::new(()),
            wal_tx,
            next_seq: AtomicU64::new(0),
        };

        // Replay: we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this runs
        // inside an async context.
        for change in &changes {
            engine.replay_change(change);
        }
        if !changes.is_empty() {
            tracing::info!(
                "replayed {} WAL records: {} users, {} meetings",
                changes.len(),
                engine.users.len(),
                engine.meetings.len()
            );
        }

        Ok(engine)
    }

    fn replay_change(&self, change: &Change) {
        match change {
            Change::MeetingCreated { invitations, .. } => {
                let ids: Vec<Ulid> = invitations.iter().map(|(_, uid)| *uid).collect();
                let mut guards = self.try_lock_users(&ids);
                self.apply_meeting_change(change, &mut guards, None);
            }
            Change::InvitationAnswered { meeting_id, .. } => {
                let Some(ms) = self.get_meeting_state(meeting_id) else {
                    tracing::warn!("replay: answer for unknown meeting {meeting_id}");
                    return;
                };
                let mut meeting = ms.try_write_owned().expect("replay: uncontended write");
                let mut guards = self.try_lock_users(&meeting.participants.clone());
                self.apply_meeting_change(change, &mut guards, Some(&mut *meeting));
            }
            Change::ParticipantAdded { user_id, .. } => {
                let mut guards = self.try_lock_users(&[*user_id]);
                self.apply_directory_change(change, guards.first_mut().map(|g| &mut **g));
            }
            other => self.apply_directory_change(other, None),
        }
    }

    fn try_lock_users(&self, ids: &[Ulid]) -> UserGuards {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        ids.iter()
            .filter_map(|id| self.get_user_state(id))
            .map(|us| us.try_write_owned().expect("replay: uncontended write"))
            .collect()
    }

    /// Acquire write locks for `ids` in ascending order to prevent deadlocks.
    pub(super) async fn lock_users(&self, ids: &[Ulid]) -> Result<UserGuards, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            let us = self.get_user_state(id).ok_or(EngineError::NotFound(*id))?;
            guards.push(us.write_owned().await);
        }
        Ok(guards)
    }

    pub(super) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Apply organization/user/event/participant changes.
    /// For `ParticipantAdded` the caller passes the user's write guard.
    pub(super) fn apply_directory_change(&self, change: &Change, user: Option<&mut UserState>) {
        match change {
            Change::OrganizationCreated { id, name } => {
                let seq = self.next_seq();
                self.organizations.insert(
                    *id,
                    OrganizationState {
                        id: *id,
                        name: name.clone(),
                        seq,
                        users: Vec::new(),
                        events: Vec::new(),
                    },
                );
            }
            Change::UserCreated {
                id,
                organization_id,
                name,
            } => {
                let us = UserState::new(*id, *organization_id, name.clone(), self.next_seq());
                self.users.insert(*id, Arc::new(RwLock::new(us)));
                if let Some(mut org) = self.organizations.get_mut(organization_id) {
                    org.users.push(*id);
                }
            }
            Change::EventCreated {
                id,
                organization_id,
                name,
            } => {
                let seq = self.next_seq();
                self.events.insert(
                    *id,
                    EventState {
                        id: *id,
                        organization_id: *organization_id,
                        name: name.clone(),
                        seq,
                        participants: Vec::new(),
                        meetings: Vec::new(),
                    },
                );
                if let Some(mut org) = self.organizations.get_mut(organization_id) {
                    org.events.push(*id);
                }
            }
            Change::ParticipantAdded { event_id, user_id } => {
                if let Some(mut ev) = self.events.get_mut(event_id)
                    && !ev.participants.contains(user_id)
                {
                    ev.participants.push(*user_id);
                }
                if let Some(us) = user
                    && !us.events.contains(event_id)
                {
                    us.events.push(*event_id);
                }
            }
            Change::MeetingCreated { .. } | Change::InvitationAnswered { .. } => {
                unreachable!("meeting changes go through apply_meeting_change")
            }
        }
    }

    /// Apply a meeting change. Caller holds write guards for every participant
    /// and, for `InvitationAnswered`, for the meeting itself.
    pub(super) fn apply_meeting_change(
        &self,
        change: &Change,
        users: &mut UserGuards,
        meeting: Option<&mut MeetingState>,
    ) {
        match change {
            Change::MeetingCreated {
                id,
                event_id,
                span,
                invitations,
            } => {
                let ms = MeetingState {
                    id: *id,
                    event_id: *event_id,
                    span: *span,
                    seq: self.next_seq(),
                    participants: invitations.iter().map(|(_, uid)| *uid).collect(),
                    invitations: invitations
                        .iter()
                        .map(|(inv_id, uid)| Invitation {
                            id: *inv_id,
                            user_id: *uid,
                            meeting_id: *id,
                            status: InvitationStatus::Pending,
                        })
                        .collect(),
                    scheduled: false,
                };
                for (inv_id, uid) in invitations {
                    self.invitation_to_meeting.insert(*inv_id, *id);
                    if let Some(us) = users.iter_mut().find(|g| g.id == *uid) {
                        us.invitations.push(*inv_id);
                        us.insert_slot(MeetingSlot {
                            meeting_id: *id,
                            span: *span,
                            scheduled: false,
                        });
                    }
                }
                self.meetings.insert(*id, Arc::new(RwLock::new(ms)));
                if let Some(mut ev) = self.events.get_mut(event_id) {
                    ev.meetings.push(*id);
                }
            }
            Change::InvitationAnswered {
                id,
                meeting_id,
                status,
                scheduled,
            } => {
                let Some(ms) = meeting else { return };
                if let Some(inv) = ms.invitation_mut(*id) {
                    inv.status = *status;
                }
                ms.scheduled = *scheduled;
                for us in users.iter_mut() {
                    us.set_scheduled(*meeting_id, *scheduled);
                }
            }
            other => self.apply_directory_change(other, None),
        }
    }

    /// Write a change to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, change: &Change) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                change: change.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_user_state(&self, id: &Ulid) -> Option<SharedUserState> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn get_meeting_state(&self, id: &Ulid) -> Option<SharedMeetingState> {
        self.meetings.get(id).map(|e| e.value().clone())
    }

    pub fn get_meeting_for_invitation(&self, invitation_id: &Ulid) -> Option<Ulid> {
        self.invitation_to_meeting
            .get(invitation_id)
            .map(|e| *e.value())
    }

    pub(super) fn id_taken(&self, id: &Ulid) -> bool {
        self.organizations.contains_key(id)
            || self.users.contains_key(id)
            || self.events.contains_key(id)
            || self.meetings.contains_key(id)
            || self.invitation_to_meeting.contains_key(id)
    }

    /// Claim `id` for a creation in progress. The claim is released when the
    /// returned guard drops, whether or not the creation committed.
    pub(super) fn reserve_id(&self, id: Ulid) -> Result<IdReservation<'_>, EngineError> {
        if self.id_taken(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.ids_in_flight.insert(id, ()).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        // Re-check: a creation may have committed between the first check and the claim.
        if self.id_taken(&id) {
            self.ids_in_flight.remove(&id);
            return Err(EngineError::AlreadyExists(id));
        }
        Ok(IdReservation { engine: self, id })
    }
}

pub(super) struct IdReservation<'a> {
    engine: &'a Engine,
    id: Ulid,
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        self.engine.ids_in_flight.remove(&self.id);
    }
}
