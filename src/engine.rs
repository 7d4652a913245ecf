//! The lobby engine: one task per lobby owning its [`Lobby`] and applying
//! commands from every connection strictly one after another.

use crate::{
    challenge::ExecutionResult,
    lobby::{Lobby, LobbyError, LobbyState, Outbox, Profile, UserId},
    packets::{self, InboundPacket, OutboundPacket, PlayerStatus},
    round::{self, EndCause},
    session::close_code,
    state::{LobbyRegistry, Services},
};
use axum::extract::ws::{CloseFrame, Message};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Trial,
    Submission,
}

#[derive(Debug)]
struct RunFinished {
    user: UserId,
    kind: RunKind,
    code: String,
    language: String,
    outcome: Result<Vec<ExecutionResult>, String>,
}

#[derive(Debug)]
enum Command {
    Join {
        profile: Profile,
        reply: oneshot::Sender<Result<(), LobbyError>>,
    },
    Connect {
        user: UserId,
        outbox: Outbox,
        reply: oneshot::Sender<Result<(), LobbyError>>,
    },
    Disconnect {
        user: UserId,
        outbox: Outbox,
    },
    Packet {
        user: UserId,
        packet: InboundPacket,
    },
    RunFinished(RunFinished),
    EndRound(EndCause),
    Summary(oneshot::Sender<LobbySummary>),
}

/// Listing entry for `GET /lobbies`.
#[derive(Debug, Clone, Serialize)]
pub struct LobbySummary {
    pub id: Uuid,
    pub owner: Profile,
    pub users: usize,
    pub max_players: usize,
    pub state: &'static str,
    pub locked: bool,
}

/// Cheap, cloneable address of a running lobby engine.
#[derive(Debug, Clone)]
pub struct LobbyHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<Command>,
}

impl LobbyHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, command: Command) -> Result<(), LobbyError> {
        self.tx.send(command).map_err(|_| LobbyError::Closed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LobbyError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        response.await.map_err(|_| LobbyError::Closed)
    }

    /// Makes `profile` a member, subject to capacity, lock and state.
    pub async fn join(&self, profile: Profile) -> Result<(), LobbyError> {
        self.request(|reply| Command::Join { profile, reply }).await?
    }

    /// Binds `outbox` as the member's connection and sends it a snapshot.
    pub async fn connect(&self, user: UserId, outbox: Outbox) -> Result<(), LobbyError> {
        self.request(|reply| Command::Connect {
            user,
            outbox,
            reply,
        })
        .await?
    }

    pub fn disconnect(&self, user: UserId, outbox: Outbox) {
        let _ = self.send(Command::Disconnect { user, outbox });
    }

    pub fn dispatch(&self, user: UserId, packet: InboundPacket) -> Result<(), LobbyError> {
        self.send(Command::Packet { user, packet })
    }

    pub async fn summary(&self) -> Result<LobbySummary, LobbyError> {
        self.request(Command::Summary).await
    }

    pub(crate) fn end_round(&self, cause: EndCause) {
        let _ = self.send(Command::EndRound(cause));
    }
}

pub(crate) fn spawn(lobby: Lobby, services: Services, registry: LobbyRegistry) -> LobbyHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = LobbyHandle { id: lobby.id(), tx };
    let engine = LobbyEngine {
        lobby,
        services,
        registry,
        handle: handle.clone(),
        rx,
    };
    tokio::spawn(engine.run());
    handle
}

enum Flow {
    Continue,
    Stop,
}

struct LobbyEngine {
    lobby: Lobby,
    services: Services,
    registry: LobbyRegistry,
    handle: LobbyHandle,
    rx: mpsc::UnboundedReceiver<Command>,
}

/// Takes the lobby off the registry when the engine task ends, even by panic.
struct Listing {
    registry: LobbyRegistry,
    id: Uuid,
}

impl Drop for Listing {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

fn encode(packet: &OutboundPacket) -> Option<String> {
    packets::encode(packet)
        .map_err(|e| error!(kind = packet.kind(), "failed to encode packet: {e}"))
        .ok()
}

/// Queues `message` without waiting; false when the connection is too far behind.
fn push(outbox: &Outbox, message: Message) -> bool {
    !matches!(outbox.try_send(message), Err(TrySendError::Full(_)))
}

fn close(outbox: &Outbox, code: u16, reason: &'static str) {
    push(
        outbox,
        Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    );
}

impl LobbyEngine {
    async fn run(mut self) {
        let id = self.lobby.id();
        info!(lobby = %id, owner = self.lobby.owner(), "lobby opened");
        let listing = Listing {
            registry: self.registry.clone(),
            id,
        };

        while let Some(command) = self.rx.recv().await {
            if let Flow::Stop = self.apply(command).await {
                break;
            }
        }

        drop(listing);
        for outbox in self.lobby.take_outboxes() {
            close(&outbox, close_code::NORMAL, "lobby closed");
        }
        info!(lobby = %id, "lobby closed");
    }

    async fn apply(&mut self, command: Command) -> Flow {
        match command {
            Command::Join { profile, reply } => {
                let user = profile.id;
                let result = self.lobby.admit(profile);
                match &result {
                    Ok(()) => {
                        info!(lobby = %self.lobby.id(), user, "user joined");
                        self.broadcast(&self.lobby.users_update());
                    }
                    Err(e) => debug!(lobby = %self.lobby.id(), user, "join refused: {e}"),
                }
                let _ = reply.send(result);
            }
            Command::Connect {
                user,
                outbox,
                reply,
            } => match self.lobby.attach(user, outbox) {
                Ok(previous) => {
                    if let Some(previous) = previous {
                        close(&previous, close_code::FORBIDDEN, "connected elsewhere");
                    }
                    self.send_to(user, &self.lobby.snapshot());
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Disconnect { user, outbox } => {
                if self.lobby.detach(user, &outbox) {
                    debug!(lobby = %self.lobby.id(), user, "connection released");
                }
            }
            Command::Packet { user, packet } => return self.handle_packet(user, packet).await,
            Command::RunFinished(run) => self.finish_run(run),
            Command::EndRound(cause) => {
                let results = self.lobby.final_results();
                self.broadcast(&OutboundPacket::GameEnded { cause, results });
                return Flow::Stop;
            }
            Command::Summary(reply) => {
                let _ = reply.send(self.summary());
            }
        }
        Flow::Continue
    }

    fn summary(&self) -> LobbySummary {
        LobbySummary {
            id: self.lobby.id(),
            owner: self.lobby.owner_profile(),
            users: self.lobby.member_count(),
            max_players: self.lobby.settings().max_players,
            state: match self.lobby.state() {
                LobbyState::PreRound(_) => "preRound",
                LobbyState::InRound(_) => "inRound",
            },
            locked: self.lobby.is_locked(),
        }
    }

    /// Sends to every connected member; members without a connection are skipped.
    fn broadcast(&mut self, packet: &OutboundPacket) {
        let Some(text) = encode(packet) else { return };
        let lagging: Vec<UserId> = self
            .lobby
            .outboxes()
            .filter(|(_, outbox)| !push(outbox, Message::Text(text.clone())))
            .map(|(user, _)| user)
            .collect();
        for user in lagging {
            self.drop_connection(user);
        }
    }

    fn send_to(&mut self, user: UserId, packet: &OutboundPacket) {
        let Some(outbox) = self.lobby.outbox(user) else { return };
        let Some(text) = encode(packet) else { return };
        if !push(outbox, Message::Text(text)) {
            self.drop_connection(user);
        }
    }

    /// Lets go of a connection whose outbox is full; the member stays and
    /// can reconnect for a fresh snapshot.
    fn drop_connection(&mut self, user: UserId) {
        if let Some(outbox) = self.lobby.outbox(user).cloned() {
            self.lobby.detach(user, &outbox);
            warn!(lobby = %self.lobby.id(), user, "dropped lagging connection");
        }
    }

    fn rejected(&self, user: UserId, kind: &str, error: LobbyError) {
        match error {
            LobbyError::NotOwner(_) => {
                warn!(lobby = %self.lobby.id(), user, kind, "permission denied: {error}")
            }
            _ => debug!(lobby = %self.lobby.id(), user, kind, "ignored: {error}"),
        }
    }

    async fn handle_packet(&mut self, user: UserId, packet: InboundPacket) -> Flow {
        let kind = packet.kind();
        debug!(lobby = %self.lobby.id(), user, kind, "packet");

        match packet {
            InboundPacket::UpdateSettings { settings } => {
                match self.lobby.update_settings(user, settings) {
                    Ok(()) => self.broadcast(&self.lobby.snapshot()),
                    Err(e) => self.rejected(user, kind, e),
                }
            }
            InboundPacket::UpdatePlayerStatus { status } => {
                self.set_ready(user, status == PlayerStatus::Ready)
            }
            InboundPacket::SetReady { ready } => self.set_ready(user, ready),
            InboundPacket::StartRound { start } => {
                if start {
                    self.start_round(user).await;
                }
            }
            InboundPacket::CheckCode { code, language } => self.check(user, code, language),
            InboundPacket::SubmitCode { code, language } => self.submit(user, code, language),
            InboundPacket::LockLobby { lock } => match self.lobby.set_locked(user, lock) {
                Ok(()) => {
                    info!(lobby = %self.lobby.id(), locked = lock, "lock changed");
                    self.broadcast(&self.lobby.snapshot());
                }
                Err(e) => self.rejected(user, kind, e),
            },
            InboundPacket::DeleteLobby { delete } => {
                if !delete {
                    return Flow::Continue;
                }
                match self.lobby.check_delete(user) {
                    Ok(()) => {
                        info!(lobby = %self.lobby.id(), "lobby deleted by owner");
                        self.broadcast(&OutboundPacket::LobbyDelete { deleted: true });
                        return Flow::Stop;
                    }
                    Err(e) => self.rejected(user, kind, e),
                }
            }
            InboundPacket::KickUser { user_id } => match self.lobby.kick(user, user_id) {
                Ok(member) => {
                    info!(lobby = %self.lobby.id(), user = user_id, "user kicked");
                    self.registry.release(user_id, self.lobby.id());
                    if let Some(outbox) = member.into_outbox() {
                        close(&outbox, close_code::FORBIDDEN, "kicked");
                    }
                    self.broadcast(&self.lobby.users_update());
                }
                Err(e) => self.rejected(user, kind, e),
            },
        }
        Flow::Continue
    }

    fn set_ready(&mut self, user: UserId, ready: bool) {
        match self.lobby.set_ready(user, ready) {
            Ok(()) => self.broadcast(&self.lobby.users_update()),
            Err(e) => self.rejected(user, "ready", e),
        }
    }

    async fn start_round(&mut self, user: UserId) {
        let id = self.lobby.id();
        match self.lobby.check_start(user) {
            Ok(()) => {}
            Err(LobbyError::NotAllReady) => {
                self.broadcast(&OutboundPacket::error(
                    "cannot start: not every player is ready",
                ));
                return;
            }
            Err(e) => return self.rejected(user, "start", e),
        }

        if self.lobby.settings().allowed_languages.is_empty() {
            match self.services.runner.available_languages().await {
                Ok(languages) if !languages.is_empty() => {
                    self.lobby.set_allowed_languages(languages)
                }
                Ok(_) => {
                    self.send_to(user, &OutboundPacket::error("cannot start: no languages available"));
                    return;
                }
                Err(e) => {
                    warn!(lobby = %id, "failed to fetch languages: {e}");
                    self.send_to(user, &OutboundPacket::error(format!("cannot start: {e}")));
                    return;
                }
            }
        }

        let challenge = match self.lobby.settings().challenge_id {
            Some(challenge_id) => self.services.backend.challenge(challenge_id).await,
            None => self.services.backend.random_challenge().await,
        };
        let challenge = match challenge {
            Ok(challenge) => challenge,
            Err(e) => {
                warn!(lobby = %id, "failed to fetch challenge: {e}");
                self.send_to(user, &OutboundPacket::error(format!("cannot start: {e}")));
                return;
            }
        };

        let (started, deadline, cancel) = match self.lobby.begin_round(challenge, Utc::now()) {
            Ok(round) => (
                OutboundPacket::GameStarted {
                    start_time: round.start_time,
                    challenge: round.challenge.clone(),
                },
                round.deadline,
                round.cancel.clone(),
            ),
            Err(e) => {
                warn!(lobby = %id, "round not started: {e}");
                self.send_to(user, &OutboundPacket::error(format!("cannot start: {e}")));
                return;
            }
        };
        info!(lobby = %id, players = self.lobby.member_count(), "round started");
        self.broadcast(&started);

        if let Some(record) = self.lobby.match_record() {
            let backend = self.services.backend.clone();
            tokio::spawn(async move {
                if let Err(e) = backend.create_match(&record).await {
                    warn!(lobby = %record.unique_id, "failed to persist match: {e}");
                }
            });
        }

        tokio::spawn(round::orchestrate(
            self.handle.clone(),
            self.registry.clone(),
            self.services.backend.clone(),
            deadline,
            cancel,
        ));
    }

    fn check(&mut self, user: UserId, code: String, language: String) {
        match self.lobby.trial_inputs(user, &language) {
            Ok(inputs) => self.execute(user, RunKind::Trial, code, language, inputs),
            Err(e @ LobbyError::LanguageNotAllowed(_)) => self.send_to(
                user,
                &OutboundPacket::CheckResult {
                    error: Some(e.to_string()),
                    result: Vec::new(),
                },
            ),
            Err(e) => self.rejected(user, "check", e),
        }
    }

    fn submit(&mut self, user: UserId, code: String, language: String) {
        match self.lobby.begin_submission(user, &language) {
            Ok(inputs) => self.execute(user, RunKind::Submission, code, language, inputs),
            Err(e @ (LobbyError::LanguageNotAllowed(_) | LobbyError::AlreadySubmitted)) => self
                .send_to(
                    user,
                    &OutboundPacket::SubmitResult {
                        error: Some(e.to_string()),
                        result: Vec::new(),
                    },
                ),
            Err(e) => self.rejected(user, "submit", e),
        }
    }

    /// Runs code off the engine task; the outcome comes back as a command.
    fn execute(
        &self,
        user: UserId,
        kind: RunKind,
        code: String,
        language: String,
        inputs: Vec<String>,
    ) {
        let runner = self.services.runner.clone();
        let engine = self.handle.clone();
        tokio::spawn(async move {
            let outcome = runner
                .run(&language, &code, &inputs)
                .await
                .map_err(|e| e.to_string());
            let _ = engine.send(Command::RunFinished(RunFinished {
                user,
                kind,
                code,
                language,
                outcome,
            }));
        });
    }

    fn finish_run(&mut self, run: RunFinished) {
        let id = self.lobby.id();
        let RunFinished {
            user,
            kind,
            code,
            language,
            outcome,
        } = run;

        match (kind, outcome) {
            (RunKind::Trial, Ok(results)) => {
                let reply = match self.lobby.record_trial(user, code, language, results) {
                    Ok(trial) => OutboundPacket::CheckResult {
                        error: None,
                        result: trial.results.clone(),
                    },
                    Err(e) => return self.rejected(user, "check", e),
                };
                self.send_to(user, &reply);
            }
            (RunKind::Trial, Err(e)) => {
                warn!(lobby = %id, user, "trial run failed: {e}");
                self.send_to(
                    user,
                    &OutboundPacket::CheckResult {
                        error: Some(format!("error while running code: {e}")),
                        result: Vec::new(),
                    },
                );
            }
            (RunKind::Submission, Ok(results)) => {
                let (result, all_submitted) =
                    match self.lobby.record_submission(user, code, language, results) {
                        Ok(recorded) => recorded,
                        Err(e) => return self.rejected(user, "submit", e),
                    };
                info!(lobby = %id, user, passed = result.passed_tests, "code submitted");
                self.send_to(
                    user,
                    &OutboundPacket::SubmitResult {
                        error: None,
                        result: result.results.clone(),
                    },
                );

                let backend = self.services.backend.clone();
                tokio::spawn(async move {
                    if let Err(e) = backend.register_submission(id, user, &result).await {
                        warn!(lobby = %id, user, "failed to report submission: {e}");
                    }
                });

                if all_submitted {
                    if let Some(cancel) = self.lobby.round_cancel() {
                        if cancel.fire(EndCause::AllSubmitted) {
                            info!(lobby = %id, "all users submitted");
                        }
                    }
                }
            }
            (RunKind::Submission, Err(e)) => {
                warn!(lobby = %id, user, "submission run failed: {e}");
                self.lobby.abort_submission(user);
                self.send_to(
                    user,
                    &OutboundPacket::SubmitResult {
                        error: Some(format!("error while running code: {e}")),
                        result: Vec::new(),
                    },
                );
            }
        }
    }
}
