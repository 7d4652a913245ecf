use crate::{
    backend::MatchRecord,
    challenge::{Challenge, ExecutionResult, RunResult},
    packets::{OutboundPacket, StateView},
    round::RoundCancel,
};
use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use codeduel_auth_common::Claims;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::{sync::mpsc::Sender, time::Instant};
use uuid::Uuid;

pub use codeduel_auth_common::UserId;

/// Outbound half of a player's live connection.
pub type Outbox = Sender<Message>;

/// Messages queued for one connection before it counts as lagging.
pub const OUTBOX_CAPACITY: usize = 64;

pub const DEFAULT_MAX_PLAYERS: usize = 8;
pub const DEFAULT_GAME_DURATION: Duration = Duration::from_secs(15 * 60);
pub const MAX_GAME_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar: String,
}

impl From<Claims> for Profile {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.id,
            username: claims.username,
            email: claims.email,
            avatar: claims.avatar,
        }
    }
}

#[derive(Debug)]
pub struct Member {
    pub profile: Profile,
    outbox: Option<Outbox>,
}

impl Member {
    fn new(profile: Profile) -> Self {
        Self {
            profile,
            outbox: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.outbox.is_some()
    }

    pub fn into_outbox(self) -> Option<Outbox> {
        self.outbox
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub max_players: usize,
    #[serde(with = "duration_secs")]
    pub game_duration: Duration,
    #[serde(default)]
    pub allowed_languages: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<i64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_players: DEFAULT_MAX_PLAYERS,
            game_duration: DEFAULT_GAME_DURATION,
            allowed_languages: ["typescript", "python"].into_iter().map(String::from).collect(),
            challenge_id: None,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LobbyError {
    #[error("user {0} is not the lobby owner")]
    NotOwner(UserId),
    #[error("user {0} is not a member of this lobby")]
    NotMember(UserId),
    #[error("lobby is not waiting for players")]
    NotInPreRound,
    #[error("no round is running")]
    NotInRound,
    #[error("lobby is full")]
    Full,
    #[error("lobby is locked")]
    Locked,
    #[error("not every player is ready")]
    NotAllReady,
    #[error("code already submitted")]
    AlreadySubmitted,
    #[error("language {0} is not allowed in this lobby")]
    LanguageNotAllowed(String),
    #[error("the owner cannot be kicked")]
    CannotKickOwner,
    #[error("user is already in another lobby")]
    InAnotherLobby,
    #[error("round duration out of range")]
    InvalidDuration,
    #[error("lobby is closed")]
    Closed,
}

#[derive(Debug, Default)]
pub struct PreRound {
    pub ready: HashSet<UserId>,
}

#[derive(Debug, Default)]
pub struct Progress {
    pub last_trial: Option<RunResult>,
    pub submission: Option<RunResult>,
}

#[derive(Debug)]
pub struct Round {
    pub challenge: Challenge,
    pub start_time: DateTime<Utc>,
    pub deadline: Instant,
    pub progress: HashMap<UserId, Progress>,
    /// Members when the round began; the denominator for "everyone submitted".
    pub participants: BTreeSet<UserId>,
    pub submit_count: usize,
    pending: HashSet<UserId>,
    pub cancel: RoundCancel,
}

impl Round {
    fn has_submitted(&self, user: UserId) -> bool {
        self.progress
            .get(&user)
            .is_some_and(|p| p.submission.is_some())
    }

    pub fn all_submitted(&self) -> bool {
        self.submit_count >= self.participants.len()
    }
}

#[derive(Debug)]
pub enum LobbyState {
    PreRound(PreRound),
    InRound(Round),
}

/// A lobby's data and every rule that mutates it. Not synchronized; the
/// owning engine task applies one operation at a time.
#[derive(Debug)]
pub struct Lobby {
    id: Uuid,
    owner: UserId,
    members: HashMap<UserId, Member>,
    settings: Settings,
    locked: bool,
    state: LobbyState,
}

impl Lobby {
    pub fn new(id: Uuid, owner: Profile) -> Self {
        let owner_id = owner.id;
        let mut members = HashMap::new();
        members.insert(owner_id, Member::new(owner));
        Self {
            id,
            owner: owner_id,
            members,
            settings: Settings::default(),
            locked: false,
            state: LobbyState::PreRound(PreRound::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> &LobbyState {
        &self.state
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, user: UserId) -> bool {
        self.members.contains_key(&user)
    }

    pub fn member(&self, user: UserId) -> Option<&Member> {
        self.members.get(&user)
    }

    pub fn member_ids(&self) -> BTreeSet<UserId> {
        self.members.keys().copied().collect()
    }

    fn require_owner(&self, actor: UserId) -> Result<(), LobbyError> {
        if actor == self.owner {
            Ok(())
        } else {
            Err(LobbyError::NotOwner(actor))
        }
    }

    fn pre_round_mut(&mut self) -> Result<&mut PreRound, LobbyError> {
        match &mut self.state {
            LobbyState::PreRound(pre) => Ok(pre),
            LobbyState::InRound(_) => Err(LobbyError::NotInPreRound),
        }
    }

    fn round(&self) -> Result<&Round, LobbyError> {
        match &self.state {
            LobbyState::InRound(round) => Ok(round),
            LobbyState::PreRound(_) => Err(LobbyError::NotInRound),
        }
    }

    fn round_mut(&mut self) -> Result<&mut Round, LobbyError> {
        match &mut self.state {
            LobbyState::InRound(round) => Ok(round),
            LobbyState::PreRound(_) => Err(LobbyError::NotInRound),
        }
    }

    /// Adds a member. Existing members are let back in unconditionally.
    pub fn admit(&mut self, profile: Profile) -> Result<(), LobbyError> {
        if let Some(member) = self.members.get_mut(&profile.id) {
            member.profile = profile;
            return Ok(());
        }
        if matches!(self.state, LobbyState::InRound(_)) {
            return Err(LobbyError::NotInPreRound);
        }
        if self.locked {
            return Err(LobbyError::Locked);
        }
        if self.members.len() >= self.settings.max_players {
            return Err(LobbyError::Full);
        }
        self.members.insert(profile.id, Member::new(profile));
        Ok(())
    }

    /// Binds a connection to a member, returning the one it replaced.
    pub fn attach(&mut self, user: UserId, outbox: Outbox) -> Result<Option<Outbox>, LobbyError> {
        let member = self
            .members
            .get_mut(&user)
            .ok_or(LobbyError::NotMember(user))?;
        Ok(member.outbox.replace(outbox))
    }

    /// Clears the member's connection if it is still `outbox`.
    pub fn detach(&mut self, user: UserId, outbox: &Outbox) -> bool {
        match self.members.get_mut(&user) {
            Some(member) if member.outbox.as_ref().is_some_and(|o| o.same_channel(outbox)) => {
                member.outbox = None;
                true
            }
            _ => false,
        }
    }

    pub fn outbox(&self, user: UserId) -> Option<&Outbox> {
        self.members.get(&user).and_then(|m| m.outbox.as_ref())
    }

    pub fn outboxes(&self) -> impl Iterator<Item = (UserId, &Outbox)> {
        self.members
            .iter()
            .filter_map(|(id, m)| m.outbox.as_ref().map(|o| (*id, o)))
    }

    pub fn take_outboxes(&mut self) -> Vec<Outbox> {
        self.members
            .values_mut()
            .filter_map(|m| m.outbox.take())
            .collect()
    }

    /// Replaces the settings; a max-player value below the current
    /// membership (or zero) keeps the previous one, and so does a round
    /// duration outside one second to [`MAX_GAME_DURATION`].
    pub fn update_settings(&mut self, actor: UserId, settings: Settings) -> Result<(), LobbyError> {
        self.require_owner(actor)?;
        self.pre_round_mut()?;
        let max_players = if settings.max_players >= self.members.len().max(1) {
            settings.max_players
        } else {
            self.settings.max_players
        };
        let game_duration = if (Duration::from_secs(1)..=MAX_GAME_DURATION)
            .contains(&settings.game_duration)
        {
            settings.game_duration
        } else {
            self.settings.game_duration
        };
        self.settings = Settings {
            max_players,
            game_duration,
            ..settings
        };
        Ok(())
    }

    pub fn set_ready(&mut self, actor: UserId, ready: bool) -> Result<(), LobbyError> {
        if !self.is_member(actor) {
            return Err(LobbyError::NotMember(actor));
        }
        let pre = self.pre_round_mut()?;
        if ready {
            pre.ready.insert(actor);
        } else {
            pre.ready.remove(&actor);
        }
        Ok(())
    }

    pub fn set_locked(&mut self, actor: UserId, locked: bool) -> Result<(), LobbyError> {
        self.require_owner(actor)?;
        self.pre_round_mut()?;
        self.locked = locked;
        Ok(())
    }

    pub fn check_start(&self, actor: UserId) -> Result<(), LobbyError> {
        self.require_owner(actor)?;
        match &self.state {
            LobbyState::InRound(_) => Err(LobbyError::NotInPreRound),
            LobbyState::PreRound(pre) => {
                if self.members.keys().all(|id| pre.ready.contains(id)) {
                    Ok(())
                } else {
                    Err(LobbyError::NotAllReady)
                }
            }
        }
    }

    pub fn set_allowed_languages(&mut self, languages: impl IntoIterator<Item = String>) {
        self.settings.allowed_languages = languages.into_iter().collect();
    }

    /// PreRound -> InRound. There is no way back.
    pub fn begin_round(
        &mut self,
        challenge: Challenge,
        start_time: DateTime<Utc>,
    ) -> Result<&Round, LobbyError> {
        self.pre_round_mut()?;
        let deadline = Instant::now()
            .checked_add(self.settings.game_duration)
            .ok_or(LobbyError::InvalidDuration)?;
        let round = Round {
            challenge,
            start_time,
            deadline,
            progress: HashMap::new(),
            participants: self.member_ids(),
            submit_count: 0,
            pending: HashSet::new(),
            cancel: RoundCancel::new(),
        };
        self.state = LobbyState::InRound(round);
        self.round()
    }

    pub fn check_delete(&self, actor: UserId) -> Result<(), LobbyError> {
        self.require_owner(actor)?;
        match self.state {
            LobbyState::PreRound(_) => Ok(()),
            LobbyState::InRound(_) => Err(LobbyError::NotInPreRound),
        }
    }

    pub fn kick(&mut self, actor: UserId, target: UserId) -> Result<Member, LobbyError> {
        self.require_owner(actor)?;
        if target == self.owner {
            return Err(LobbyError::CannotKickOwner);
        }
        if !self.is_member(target) {
            return Err(LobbyError::NotMember(target));
        }
        self.pre_round_mut()?.ready.remove(&target);
        self.members
            .remove(&target)
            .ok_or(LobbyError::NotMember(target))
    }

    fn check_language(&self, language: &str) -> Result<(), LobbyError> {
        if self.settings.allowed_languages.contains(language) {
            Ok(())
        } else {
            Err(LobbyError::LanguageNotAllowed(language.to_string()))
        }
    }

    /// Inputs for a trial run against the visible test cases.
    pub fn trial_inputs(&self, actor: UserId, language: &str) -> Result<Vec<String>, LobbyError> {
        let round = self.round()?;
        if !self.is_member(actor) {
            return Err(LobbyError::NotMember(actor));
        }
        self.check_language(language)?;
        Ok(round.challenge.visible_inputs())
    }

    /// Marks a submission as in flight and returns the hidden inputs.
    pub fn begin_submission(
        &mut self,
        actor: UserId,
        language: &str,
    ) -> Result<Vec<String>, LobbyError> {
        self.round()?;
        if !self.is_member(actor) {
            return Err(LobbyError::NotMember(actor));
        }
        self.check_language(language)?;
        let round = self.round_mut()?;
        if round.has_submitted(actor) || round.pending.contains(&actor) {
            return Err(LobbyError::AlreadySubmitted);
        }
        round.pending.insert(actor);
        Ok(round.challenge.hidden_inputs())
    }

    pub fn abort_submission(&mut self, user: UserId) {
        if let Ok(round) = self.round_mut() {
            round.pending.remove(&user);
        }
    }

    pub fn record_trial(
        &mut self,
        user: UserId,
        code: String,
        language: String,
        results: Vec<ExecutionResult>,
    ) -> Result<&RunResult, LobbyError> {
        let round = self.round_mut()?;
        let result = RunResult::new(code, language, &round.challenge.test_cases, results);
        let progress = round.progress.entry(user).or_default();
        let trial: &RunResult = progress.last_trial.insert(result);
        Ok(trial)
    }

    /// Stores the final submission. Returns the result and whether every
    /// participant has now submitted.
    pub fn record_submission(
        &mut self,
        user: UserId,
        code: String,
        language: String,
        results: Vec<ExecutionResult>,
    ) -> Result<(RunResult, bool), LobbyError> {
        let round = self.round_mut()?;
        round.pending.remove(&user);
        if round.has_submitted(user) {
            return Err(LobbyError::AlreadySubmitted);
        }
        let result = RunResult::new(code, language, &round.challenge.hidden_test_cases, results);
        round.progress.entry(user).or_default().submission = Some(result.clone());
        if round.participants.contains(&user) {
            round.submit_count += 1;
        }
        Ok((result, round.all_submitted()))
    }

    pub fn round_cancel(&self) -> Option<&RoundCancel> {
        self.round().ok().map(|r| &r.cancel)
    }

    pub fn match_record(&self) -> Option<MatchRecord> {
        let round = self.round().ok()?;
        Some(MatchRecord {
            unique_id: self.id,
            owner_id: self.owner,
            users: round.participants.iter().copied().collect(),
            challenge_id: round.challenge.id,
            mode_id: 1,
            ended: false,
            max_players: self.settings.max_players,
            allowed_languages: self
                .settings
                .allowed_languages
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(","),
            game_duration: self.settings.game_duration.as_secs(),
        })
    }

    /// Hidden tests passed per user with a final submission.
    pub fn final_results(&self) -> BTreeMap<UserId, usize> {
        let Ok(round) = self.round() else {
            return BTreeMap::new();
        };
        round
            .progress
            .iter()
            .filter_map(|(id, p)| p.submission.as_ref().map(|s| (*id, s.passed_tests)))
            .collect()
    }

    fn profiles(&self) -> BTreeMap<UserId, Profile> {
        self.members
            .iter()
            .map(|(id, m)| (*id, m.profile.clone()))
            .collect()
    }

    fn ready_list(&self) -> Option<Vec<UserId>> {
        match &self.state {
            LobbyState::PreRound(pre) => {
                let mut ready: Vec<_> = pre.ready.iter().copied().collect();
                ready.sort_unstable();
                Some(ready)
            }
            LobbyState::InRound(_) => None,
        }
    }

    pub fn state_view(&self) -> StateView {
        match &self.state {
            LobbyState::PreRound(_) => StateView::PreRound {
                ready_users: self.ready_list().unwrap_or_default(),
            },
            LobbyState::InRound(round) => StateView::InRound {
                challenge: round.challenge.clone(),
                start_time: round.start_time,
                submitted: self.final_results().into_keys().collect(),
            },
        }
    }

    pub fn owner_profile(&self) -> Profile {
        self.members
            .get(&self.owner)
            .map(|m| m.profile.clone())
            .unwrap_or_else(|| Profile {
                id: self.owner,
                username: String::new(),
                email: String::new(),
                avatar: String::new(),
            })
    }

    pub fn snapshot(&self) -> OutboundPacket {
        OutboundPacket::Lobby {
            id: self.id,
            settings: self.settings.clone(),
            owner: self.owner_profile(),
            users: self.profiles(),
            state: self.state_view(),
            locked: self.locked,
        }
    }

    pub fn users_update(&self) -> OutboundPacket {
        OutboundPacket::UsersUpdate {
            users: self.profiles(),
            ready_users: self.ready_list(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::TestCase;
    use tokio::sync::mpsc;

    fn profile(id: UserId) -> Profile {
        Profile {
            id,
            username: format!("user{id}"),
            email: String::new(),
            avatar: String::new(),
        }
    }

    fn challenge() -> Challenge {
        Challenge {
            id: 9,
            title: "Sum".into(),
            description: String::new(),
            test_cases: vec![TestCase::new("1 2", "3")],
            hidden_test_cases: vec![TestCase::new("100 1", "101"), TestCase::new("2 2", "4")],
        }
    }

    fn ok(output: &str) -> ExecutionResult {
        ExecutionResult {
            output: output.into(),
            error: String::new(),
            status: 0,
        }
    }

    fn lobby_with(members: &[UserId]) -> Lobby {
        let mut lobby = Lobby::new(Uuid::new_v4(), profile(members[0]));
        for id in &members[1..] {
            lobby.admit(profile(*id)).unwrap();
        }
        lobby
    }

    fn started(members: &[UserId]) -> Lobby {
        let mut lobby = lobby_with(members);
        for id in members {
            lobby.set_ready(*id, true).unwrap();
        }
        lobby.check_start(members[0]).unwrap();
        lobby.begin_round(challenge(), Utc::now()).unwrap();
        lobby
    }

    #[test]
    fn new_lobby_contains_only_owner() {
        let lobby = lobby_with(&[1]);
        assert_eq!(lobby.member_ids(), BTreeSet::from([1]));
        assert_eq!(lobby.owner(), 1);
        assert!(matches!(lobby.state(), LobbyState::PreRound(pre) if pre.ready.is_empty()));
    }

    #[test]
    fn membership_never_exceeds_max_players() {
        let mut lobby = lobby_with(&[1]);
        let mut settings = lobby.settings().clone();
        settings.max_players = 2;
        lobby.update_settings(1, settings).unwrap();
        lobby.admit(profile(2)).unwrap();
        assert_eq!(lobby.admit(profile(3)), Err(LobbyError::Full));
        assert_eq!(lobby.member_count(), 2);
        // rejoining is always fine
        assert_eq!(lobby.admit(profile(2)), Ok(()));
    }

    #[test]
    fn max_players_below_membership_is_ignored() {
        let mut lobby = lobby_with(&[1, 2, 3]);
        let settings = Settings {
            max_players: 2,
            game_duration: Duration::from_secs(60),
            allowed_languages: BTreeSet::from(["c".to_string()]),
            challenge_id: Some(4),
        };
        lobby.update_settings(1, settings).unwrap();
        assert_eq!(lobby.settings().max_players, DEFAULT_MAX_PLAYERS);
        assert_eq!(lobby.settings().game_duration, Duration::from_secs(60));
        assert_eq!(lobby.settings().challenge_id, Some(4));
        assert!(lobby.settings().allowed_languages.contains("c"));
    }

    #[test]
    fn out_of_range_duration_keeps_the_previous_one() {
        let mut lobby = lobby_with(&[1]);
        for secs in [0, u64::MAX, MAX_GAME_DURATION.as_secs() + 1] {
            let settings = Settings {
                game_duration: Duration::from_secs(secs),
                ..Settings::default()
            };
            lobby.update_settings(1, settings).unwrap();
            assert_eq!(lobby.settings().game_duration, DEFAULT_GAME_DURATION);
        }
        let settings = Settings {
            game_duration: MAX_GAME_DURATION,
            ..Settings::default()
        };
        lobby.update_settings(1, settings).unwrap();
        assert_eq!(lobby.settings().game_duration, MAX_GAME_DURATION);
    }

    #[test]
    fn unrepresentable_deadline_refuses_to_start() {
        let mut lobby = lobby_with(&[1]);
        lobby.settings.game_duration = Duration::MAX;
        assert_eq!(
            lobby.begin_round(challenge(), Utc::now()).map(|_| ()),
            Err(LobbyError::InvalidDuration)
        );
        assert!(matches!(lobby.state(), LobbyState::PreRound(_)));
    }

    #[test]
    fn only_owner_changes_settings() {
        let mut lobby = lobby_with(&[1, 2]);
        assert_eq!(
            lobby.update_settings(2, Settings::default()),
            Err(LobbyError::NotOwner(2))
        );
    }

    #[test]
    fn locked_lobby_refuses_newcomers_but_not_members() {
        let mut lobby = lobby_with(&[1, 2]);
        lobby.set_locked(1, true).unwrap();
        assert_eq!(lobby.admit(profile(3)), Err(LobbyError::Locked));
        assert_eq!(lobby.admit(profile(2)), Ok(()));
        assert_eq!(lobby.set_locked(2, false), Err(LobbyError::NotOwner(2)));
    }

    #[test]
    fn start_requires_owner_and_everyone_ready() {
        let mut lobby = lobby_with(&[1, 2]);
        lobby.set_ready(1, true).unwrap();
        assert_eq!(lobby.check_start(1), Err(LobbyError::NotAllReady));
        lobby.set_ready(2, true).unwrap();
        assert_eq!(lobby.check_start(2), Err(LobbyError::NotOwner(2)));
        assert_eq!(lobby.check_start(1), Ok(()));
        lobby.set_ready(2, false).unwrap();
        assert_eq!(lobby.check_start(1), Err(LobbyError::NotAllReady));
    }

    #[test]
    fn single_ready_owner_can_start() {
        let lobby = started(&[1]);
        match lobby.state() {
            LobbyState::InRound(round) => {
                assert_eq!(round.challenge.id, 9);
                assert_eq!(round.submit_count, 0);
                assert!(round.progress.is_empty());
                assert!(!round.cancel.is_fired());
            }
            LobbyState::PreRound(_) => panic!("round should have started"),
        }
    }

    #[test]
    fn in_round_rejects_pre_round_operations() {
        let mut lobby = started(&[1, 2]);
        assert_eq!(lobby.check_start(1), Err(LobbyError::NotInPreRound));
        assert_eq!(lobby.set_ready(2, false), Err(LobbyError::NotInPreRound));
        assert_eq!(
            lobby.update_settings(1, Settings::default()),
            Err(LobbyError::NotInPreRound)
        );
        assert_eq!(lobby.kick(1, 2).map(|_| ()), Err(LobbyError::NotInPreRound));
        assert_eq!(lobby.check_delete(1), Err(LobbyError::NotInPreRound));
        assert_eq!(lobby.admit(profile(3)), Err(LobbyError::NotInPreRound));
        assert!(lobby.begin_round(challenge(), Utc::now()).is_err());
    }

    #[test]
    fn code_runs_require_a_round_and_allowed_language() {
        let mut lobby = lobby_with(&[1]);
        assert_eq!(lobby.trial_inputs(1, "python"), Err(LobbyError::NotInRound));
        lobby = started(&[1]);
        assert_eq!(lobby.trial_inputs(1, "python").unwrap(), vec!["1 2".to_string()]);
        assert_eq!(
            lobby.begin_submission(1, "cobol"),
            Err(LobbyError::LanguageNotAllowed("cobol".into()))
        );
    }

    #[test]
    fn second_submission_is_rejected() {
        let mut lobby = started(&[1, 2]);
        assert_eq!(lobby.begin_submission(1, "python").unwrap().len(), 2);
        assert_eq!(
            lobby.begin_submission(1, "python"),
            Err(LobbyError::AlreadySubmitted)
        );
        let (result, all) = lobby
            .record_submission(1, "x".into(), "python".into(), vec![ok("101"), ok("5")])
            .unwrap();
        assert_eq!(result.passed_tests, 1);
        assert!(!all);
        assert_eq!(
            lobby.begin_submission(1, "python"),
            Err(LobbyError::AlreadySubmitted)
        );
        assert_eq!(lobby.final_results(), BTreeMap::from([(1, 1)]));
        match lobby.state() {
            LobbyState::InRound(round) => assert_eq!(round.submit_count, 1),
            LobbyState::PreRound(_) => unreachable!(),
        }
    }

    #[test]
    fn failed_run_allows_resubmission() {
        let mut lobby = started(&[1]);
        lobby.begin_submission(1, "python").unwrap();
        lobby.abort_submission(1);
        assert!(lobby.begin_submission(1, "python").is_ok());
    }

    #[test]
    fn last_submission_completes_the_round() {
        let mut lobby = started(&[1, 2]);
        lobby.begin_submission(1, "python").unwrap();
        lobby.begin_submission(2, "python").unwrap();
        let (_, all) = lobby
            .record_submission(2, "x".into(), "python".into(), vec![ok("101"), ok("4")])
            .unwrap();
        assert!(!all);
        let (_, all) = lobby
            .record_submission(1, "x".into(), "python".into(), vec![ok("0"), ok("0")])
            .unwrap();
        assert!(all);
    }

    #[test]
    fn trial_overwrites_previous_trial() {
        let mut lobby = started(&[1]);
        lobby
            .record_trial(1, "a".into(), "python".into(), vec![ok("4")])
            .unwrap();
        let trial = lobby
            .record_trial(1, "b".into(), "python".into(), vec![ok("3")])
            .unwrap();
        assert_eq!(trial.passed_tests, 1);
        match lobby.state() {
            LobbyState::InRound(round) => {
                let progress = &round.progress[&1];
                assert_eq!(progress.last_trial.as_ref().unwrap().code, "b");
                assert!(progress.submission.is_none());
                assert_eq!(round.submit_count, 0);
            }
            LobbyState::PreRound(_) => unreachable!(),
        }
    }

    #[test]
    fn kick_is_owner_only_and_spares_the_owner() {
        let mut lobby = lobby_with(&[1, 2, 3]);
        lobby.set_ready(3, true).unwrap();
        assert_eq!(lobby.kick(2, 3).map(|_| ()), Err(LobbyError::NotOwner(2)));
        assert_eq!(lobby.kick(1, 1).map(|_| ()), Err(LobbyError::CannotKickOwner));
        assert_eq!(lobby.kick(1, 3).unwrap().profile.id, 3);
        assert!(!lobby.is_member(3));
        assert_eq!(lobby.ready_list(), Some(vec![]));
        assert_eq!(lobby.kick(1, 3).map(|_| ()), Err(LobbyError::NotMember(3)));
    }

    #[test]
    fn stale_connection_does_not_detach_a_newer_one() {
        let mut lobby = lobby_with(&[1]);
        let (old, _old_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (new, _new_rx) = mpsc::channel(OUTBOX_CAPACITY);
        assert!(lobby.attach(1, old.clone()).unwrap().is_none());
        assert!(lobby.attach(1, new.clone()).unwrap().is_some());
        assert!(!lobby.detach(1, &old));
        assert!(lobby.member(1).unwrap().is_connected());
        assert!(lobby.detach(1, &new));
        assert!(!lobby.member(1).unwrap().is_connected());
        assert!(matches!(lobby.attach(5, new), Err(LobbyError::NotMember(5))));
    }

    #[test]
    fn match_record_lists_participants() {
        let lobby = started(&[2, 1]);
        let record = lobby.match_record().unwrap();
        assert_eq!(record.owner_id, 2);
        assert_eq!(record.users, vec![1, 2]);
        assert_eq!(record.challenge_id, 9);
        assert_eq!(record.allowed_languages, "python,typescript");
        assert_eq!(record.game_duration, 900);
    }
}
