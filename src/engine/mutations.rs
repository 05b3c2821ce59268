use std::collections::HashSet;

use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_participants, validate_name, validate_span};
use super::{Engine, EngineError, WalCommand};

/// Drop repeated ids, keeping the first occurrence's position.
fn dedup_preserving_order(ids: Vec<Ulid>) -> Vec<Ulid> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

impl Engine {
    pub async fn create_organization(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        validate_name(&name)?;
        if self.organizations.len() >= MAX_ORGANIZATIONS {
            return Err(EngineError::LimitExceeded("too many organizations"));
        }
        let _gate = self.commit_gate.read().await;
        let _reservation = self.reserve_id(id)?;

        let change = Change::OrganizationCreated { id, name };
        self.wal_append(&change).await?;
        self.apply_directory_change(&change, None);
        Ok(())
    }

    pub async fn create_user(
        &self,
        id: Ulid,
        organization_id: Ulid,
        name: String,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        if !self.organizations.contains_key(&organization_id) {
            return Err(EngineError::NotFound(organization_id));
        }
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        let _gate = self.commit_gate.read().await;
        let _reservation = self.reserve_id(id)?;

        let change = Change::UserCreated {
            id,
            organization_id,
            name,
        };
        self.wal_append(&change).await?;
        self.apply_directory_change(&change, None);
        Ok(())
    }

    pub async fn create_event(
        &self,
        id: Ulid,
        organization_id: Ulid,
        name: String,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        if !self.organizations.contains_key(&organization_id) {
            return Err(EngineError::NotFound(organization_id));
        }
        if self.events.len() >= MAX_EVENTS {
            return Err(EngineError::LimitExceeded("too many events"));
        }
        let _gate = self.commit_gate.read().await;
        let _reservation = self.reserve_id(id)?;

        let change = Change::EventCreated {
            id,
            organization_id,
            name,
        };
        self.wal_append(&change).await?;
        self.apply_directory_change(&change, None);
        Ok(())
    }

    /// Add `user_id` to the event's participants. Adding an existing
    /// participant succeeds without writing anything.
    pub async fn add_event_participant(&self, event_id: Ulid, user_id: Ulid) -> Result<(), EngineError> {
        if !self.events.contains_key(&event_id) {
            return Err(EngineError::NotFound(event_id));
        }
        let _gate = self.commit_gate.read().await;
        let mut guards = self.lock_users(&[user_id]).await?;

        let participants = self
            .events
            .get(&event_id)
            .map(|ev| (ev.participants.contains(&user_id), ev.participants.len()))
            .ok_or(EngineError::NotFound(event_id))?;
        match participants {
            (true, _) => return Ok(()),
            (false, n) if n >= MAX_PARTICIPANTS_PER_EVENT => {
                return Err(EngineError::LimitExceeded("too many participants in event"));
            }
            _ => {}
        }

        let change = Change::ParticipantAdded { event_id, user_id };
        self.wal_append(&change).await?;
        self.apply_directory_change(&change, guards.first_mut().map(|g| &mut **g));
        Ok(())
    }

    /// Propose a meeting. Rejected with `Conflict` if the window overlaps a
    /// confirmed meeting of any invitee; otherwise the meeting and one pending
    /// invitation per invitee commit together as a single WAL record.
    ///
    /// All invitee locks are held from the conflict check through the commit,
    /// so two overlapping proposals sharing an invitee serialize.
    pub async fn create_meeting(
        &self,
        id: Ulid,
        event_id: Ulid,
        span: Span,
        invitee_ids: Vec<Ulid>,
    ) -> Result<MeetingInfo, EngineError> {
        validate_span(&span)?;
        let invitees = dedup_preserving_order(invitee_ids);
        if invitees.is_empty() {
            return Err(EngineError::Invalid("meeting needs at least one invitee".into()));
        }
        if invitees.len() > MAX_INVITEES_PER_MEETING {
            return Err(EngineError::LimitExceeded("too many invitees"));
        }
        if self.meetings.len() >= MAX_MEETINGS {
            return Err(EngineError::LimitExceeded("too many meetings"));
        }
        if !self.events.contains_key(&event_id) {
            return Err(EngineError::NotFound(event_id));
        }

        let _gate = self.commit_gate.read().await;
        let _reservation = self.reserve_id(id)?;
        let mut guards = self.lock_users(&invitees).await?;
        if guards.iter().any(|g| g.slots.len() >= MAX_MEETINGS_PER_USER) {
            return Err(EngineError::LimitExceeded("too many meetings for user"));
        }

        if let Err(e) = check_participants(guards.iter().map(|g| &**g), &span) {
            metrics::counter!(observability::MEETING_CONFLICTS_TOTAL).increment(1);
            debug!("rejected meeting {id}: {e}");
            return Err(e);
        }

        let invitations: Vec<(Ulid, Ulid)> = invitees.iter().map(|uid| (Ulid::new(), *uid)).collect();
        let change = Change::MeetingCreated {
            id,
            event_id,
            span,
            invitations,
        };
        self.wal_append(&change).await?;
        self.apply_meeting_change(&change, &mut guards, None);

        metrics::counter!(observability::MEETINGS_CREATED_TOTAL).increment(1);
        info!("meeting {id} proposed for event {event_id} with {} invitees", invitees.len());

        Ok(MeetingInfo {
            id,
            event_id,
            start: span.start,
            end: span.end,
            scheduled: false,
            participants: invitees,
        })
    }

    /// Record an invitee's answer and re-evaluate quorum. The meeting becomes
    /// scheduled once every invitation is accepted; it is never unscheduled.
    ///
    /// Holds the participants' locks and the meeting lock across the
    /// read-modify-write, so concurrent answers to the same meeting serialize.
    pub async fn respond_to_invitation(
        &self,
        invitation_id: Ulid,
        response: InvitationResponse,
    ) -> Result<MeetingInfo, EngineError> {
        let meeting_id = self
            .get_meeting_for_invitation(&invitation_id)
            .ok_or(EngineError::NotFound(invitation_id))?;
        let ms = self
            .get_meeting_state(&meeting_id)
            .ok_or(EngineError::NotFound(meeting_id))?;

        let _gate = self.commit_gate.read().await;
        // Participants never change, so reading them before taking the user
        // locks keeps the users-then-meeting lock order.
        let participants = ms.read().await.participants.clone();
        let mut guards = self.lock_users(&participants).await?;
        let mut meeting = ms.write().await;

        let status = response.status();
        let current = meeting
            .invitations
            .iter()
            .find(|i| i.id == invitation_id)
            .map(|i| i.status)
            .ok_or(EngineError::NotFound(invitation_id))?;
        let quorum = meeting.all_accepted_with(invitation_id, status);
        let was_scheduled = meeting.scheduled;
        let scheduled = was_scheduled || quorum;

        if current == status && scheduled == was_scheduled {
            return Ok(MeetingInfo::from(&*meeting));
        }

        let change = Change::InvitationAnswered {
            id: invitation_id,
            meeting_id,
            status,
            scheduled,
        };
        self.wal_append(&change).await?;
        self.apply_meeting_change(&change, &mut guards, Some(&mut *meeting));

        metrics::counter!(observability::INVITATION_RESPONSES_TOTAL, "status" => status.as_str())
            .increment(1);
        debug!("invitation {invitation_id} of meeting {meeting_id} {}", status.as_str());
        if scheduled && !was_scheduled {
            metrics::counter!(observability::MEETINGS_SCHEDULED_TOTAL).increment(1);
            info!(
                "meeting {meeting_id} scheduled: all {} invitees accepted",
                meeting.invitations.len()
            );
        }

        Ok(MeetingInfo::from(&*meeting))
    }

    /// Rebuild the minimal list of changes that recreates the current state.
    /// Caller must hold `commit_gate` exclusively.
    async fn snapshot_changes(&self) -> Vec<Change> {
        let mut changes = Vec::new();

        let mut orgs: Vec<(u64, Ulid, String)> = self
            .organizations
            .iter()
            .map(|o| (o.seq, o.id, o.name.clone()))
            .collect();
        orgs.sort_by_key(|(seq, ..)| *seq);
        changes.extend(
            orgs.into_iter()
                .map(|(_, id, name)| Change::OrganizationCreated { id, name }),
        );

        let user_states: Vec<_> = self.users.iter().map(|e| e.value().clone()).collect();
        let mut users = Vec::with_capacity(user_states.len());
        for us in user_states {
            let g = us.read().await;
            users.push((g.seq, g.id, g.organization_id, g.name.clone()));
        }
        users.sort_by_key(|(seq, ..)| *seq);
        changes.extend(users.into_iter().map(|(_, id, organization_id, name)| {
            Change::UserCreated {
                id,
                organization_id,
                name,
            }
        }));

        let mut events: Vec<EventState> = self.events.iter().map(|e| e.value().clone()).collect();
        events.sort_by_key(|ev| ev.seq);
        for ev in events {
            changes.push(Change::EventCreated {
                id: ev.id,
                organization_id: ev.organization_id,
                name: ev.name,
            });
            changes.extend(ev.participants.into_iter().map(|user_id| Change::ParticipantAdded {
                event_id: ev.id,
                user_id,
            }));
        }

        let meeting_states: Vec<_> = self.meetings.iter().map(|e| e.value().clone()).collect();
        let mut meetings = Vec::with_capacity(meeting_states.len());
        for ms in meeting_states {
            meetings.push(ms.read().await.clone());
        }
        meetings.sort_by_key(|m| m.seq);
        for m in meetings {
            changes.push(Change::MeetingCreated {
                id: m.id,
                event_id: m.event_id,
                span: m.span,
                invitations: m.invitations.iter().map(|i| (i.id, i.user_id)).collect(),
            });
            changes.extend(
                m.invitations
                    .iter()
                    .filter(|i| i.status != InvitationStatus::Pending)
                    .map(|i| Change::InvitationAnswered {
                        id: i.id,
                        meeting_id: m.id,
                        status: i.status,
                        scheduled: m.scheduled,
                    }),
            );
        }

        changes
    }

    /// Compact the WAL by rewriting it with only the changes needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let changes = self.snapshot_changes().await;

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { changes, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
