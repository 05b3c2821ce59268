use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn list_organizations(&self) -> Vec<OrganizationInfo> {
        let mut orgs: Vec<_> = self
            .organizations
            .iter()
            .map(|o| {
                (
                    o.seq,
                    OrganizationInfo {
                        id: o.id,
                        name: o.name.clone(),
                    },
                )
            })
            .collect();
        orgs.sort_by_key(|(seq, _)| *seq);
        orgs.into_iter().map(|(_, info)| info).collect()
    }

    pub async fn list_users(&self) -> Vec<UserInfo> {
        let ids: Vec<Ulid> = self.users.iter().map(|e| *e.key()).collect();
        self.user_infos(&ids).await
    }

    pub async fn list_organization_users(&self, organization_id: Ulid) -> Result<Vec<UserInfo>, EngineError> {
        let ids = self
            .organizations
            .get(&organization_id)
            .map(|o| o.users.clone())
            .ok_or(EngineError::NotFound(organization_id))?;
        Ok(self.user_infos(&ids).await)
    }

    /// Participants in the order they were added.
    pub async fn list_event_participants(&self, event_id: Ulid) -> Result<Vec<UserInfo>, EngineError> {
        let ids = self
            .events
            .get(&event_id)
            .map(|ev| ev.participants.clone())
            .ok_or(EngineError::NotFound(event_id))?;
        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(us) = self.get_user_state(&id) {
                let g = us.read().await;
                users.push(user_info(&g));
            }
        }
        Ok(users)
    }

    pub fn list_events(&self) -> Vec<EventInfo> {
        let ids: Vec<Ulid> = self.events.iter().map(|e| *e.key()).collect();
        self.event_infos(&ids)
    }

    pub fn list_organization_events(&self, organization_id: Ulid) -> Result<Vec<EventInfo>, EngineError> {
        let ids = self
            .organizations
            .get(&organization_id)
            .map(|o| o.events.clone())
            .ok_or(EngineError::NotFound(organization_id))?;
        Ok(self.event_infos(&ids))
    }

    /// Events the user attends.
    pub async fn list_user_events(&self, user_id: Ulid) -> Result<Vec<EventInfo>, EngineError> {
        let us = self
            .get_user_state(&user_id)
            .ok_or(EngineError::NotFound(user_id))?;
        let ids = us.read().await.events.clone();
        Ok(self.event_infos(&ids))
    }

    pub async fn get_meeting(&self, meeting_id: Ulid) -> Result<MeetingInfo, EngineError> {
        let ms = self
            .get_meeting_state(&meeting_id)
            .ok_or(EngineError::NotFound(meeting_id))?;
        let guard = ms.read().await;
        Ok(MeetingInfo::from(&*guard))
    }

    pub async fn list_meetings(&self) -> Vec<MeetingInfo> {
        let ids: Vec<Ulid> = self.meetings.iter().map(|e| *e.key()).collect();
        self.meeting_infos(&ids).await
    }

    pub async fn list_event_meetings(&self, event_id: Ulid) -> Result<Vec<MeetingInfo>, EngineError> {
        let ids = self
            .events
            .get(&event_id)
            .map(|ev| ev.meetings.clone())
            .ok_or(EngineError::NotFound(event_id))?;
        Ok(self.meeting_infos(&ids).await)
    }

    /// Every meeting the user is invited to, confirmed or not.
    pub async fn list_user_meetings(&self, user_id: Ulid) -> Result<Vec<MeetingInfo>, EngineError> {
        let invitations = self.user_invitation_ids(user_id).await?;
        let ids: Vec<Ulid> = invitations
            .iter()
            .filter_map(|inv| self.get_meeting_for_invitation(inv))
            .collect();
        Ok(self.meeting_infos(&ids).await)
    }

    pub async fn list_meeting_invitations(&self, meeting_id: Ulid) -> Result<Vec<InvitationInfo>, EngineError> {
        let ms = self
            .get_meeting_state(&meeting_id)
            .ok_or(EngineError::NotFound(meeting_id))?;
        let guard = ms.read().await;
        Ok(guard.invitations.iter().map(InvitationInfo::from).collect())
    }

    pub async fn list_user_invitations(&self, user_id: Ulid) -> Result<Vec<InvitationInfo>, EngineError> {
        let invitations = self.user_invitation_ids(user_id).await?;
        let mut infos = Vec::with_capacity(invitations.len());
        for inv_id in invitations {
            let Some(ms) = self
                .get_meeting_for_invitation(&inv_id)
                .and_then(|mid| self.get_meeting_state(&mid))
            else {
                continue;
            };
            let guard = ms.read().await;
            if let Some(inv) = guard.invitations.iter().find(|i| i.id == inv_id) {
                infos.push(InvitationInfo::from(inv));
            }
        }
        Ok(infos)
    }

    // ── Helpers ──────────────────────────────────────────────

    /// The user's invitation ids, copied out so no user lock is held while
    /// meeting locks are taken.
    async fn user_invitation_ids(&self, user_id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let us = self
            .get_user_state(&user_id)
            .ok_or(EngineError::NotFound(user_id))?;
        let ids = us.read().await.invitations.clone();
        Ok(ids)
    }

    /// Users for `ids`, in creation order.
    async fn user_infos(&self, ids: &[Ulid]) -> Vec<UserInfo> {
        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(us) = self.get_user_state(id) {
                let g = us.read().await;
                users.push((g.seq, user_info(&g)));
            }
        }
        users.sort_by_key(|(seq, _)| *seq);
        users.into_iter().map(|(_, info)| info).collect()
    }

    /// Events for `ids`, in creation order.
    fn event_infos(&self, ids: &[Ulid]) -> Vec<EventInfo> {
        let mut events: Vec<_> = ids
            .iter()
            .filter_map(|id| self.events.get(id))
            .map(|ev| {
                (
                    ev.seq,
                    EventInfo {
                        id: ev.id,
                        organization_id: ev.organization_id,
                        name: ev.name.clone(),
                    },
                )
            })
            .collect();
        events.sort_by_key(|(seq, _)| *seq);
        events.into_iter().map(|(_, info)| info).collect()
    }

    /// Meetings for `ids`, in creation order.
    async fn meeting_infos(&self, ids: &[Ulid]) -> Vec<MeetingInfo> {
        let mut meetings = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ms) = self.get_meeting_state(id) {
                let g = ms.read().await;
                meetings.push((g.seq, MeetingInfo::from(&*g)));
            }
        }
        meetings.sort_by_key(|(seq, _)| *seq);
        meetings.into_iter().map(|(_, info)| info).collect()
    }
}

fn user_info(us: &UserState) -> UserInfo {
    UserInfo {
        id: us.id,
        organization_id: us.organization_id,
        name: us.name.clone(),
    }
}
