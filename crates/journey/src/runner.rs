//! Drives a [`FlowPlayer`] on its own task.
//!
//! Host events arrive on an `mpsc` channel and are applied one at a time;
//! the resulting state is published on a `watch` channel. A command equal to
//! the one just processed, and issued before that one finished, is dropped so
//! double clicks advance once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use wayfinder_core::error::{FlowError, FlowResult};

use crate::milestones::Direction;
use crate::player::FlowPlayer;
use crate::state_machine::PlayerState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PlayerCommand {
    Start,
    Advance { direction: Direction },
    Click { button_id: String },
    Complete,
    Skip,
    RecordAnswer { field: String, value: serde_json::Value },
    Close,
    Reset,
}

struct Envelope {
    command: PlayerCommand,
    /// Commands the runner had finished when this one was sent.
    observed: u64,
}

pub struct PlayerHandle {
    commands: mpsc::Sender<Envelope>,
    state: watch::Receiver<PlayerState>,
    processed: Arc<AtomicU64>,
    task: JoinHandle<FlowPlayer>,
}

impl PlayerHandle {
    /// Spawns the player with a command queue sized by `player.command_buffer`.
    pub fn spawn(player: FlowPlayer) -> Self {
        let buffer = player.config().command_buffer;
        Self::spawn_with_buffer(player, buffer)
    }

    pub fn spawn_with_buffer(player: FlowPlayer, buffer: usize) -> Self {
        let (commands, rx) = mpsc::channel(buffer.max(1));
        let (state_tx, state) = watch::channel(player.state());
        let processed = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run(player, rx, state_tx, processed.clone()));
        Self {
            commands,
            state,
            processed,
            task,
        }
    }

    pub async fn send(&self, command: PlayerCommand) -> FlowResult<()> {
        let envelope = Envelope {
            command,
            observed: self.processed.load(Ordering::SeqCst),
        };
        self.commands
            .send(envelope)
            .await
            .map_err(|_| FlowError::Internal(anyhow_closed()))
    }

    /// Commands that may be queued before `send` waits.
    pub fn command_capacity(&self) -> usize {
        self.commands.max_capacity()
    }

    pub fn state(&self) -> PlayerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.state.clone()
    }

    /// Waits until the published state satisfies `predicate`.
    pub async fn wait_for<F>(&mut self, predicate: F) -> FlowResult<PlayerState>
    where
        F: Fn(&PlayerState) -> bool,
    {
        let state = self
            .state
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| FlowError::Internal(anyhow_closed()))?;
        Ok(state.clone())
    }

    /// Stops accepting commands and returns the player once the queue drains.
    pub async fn shutdown(self) -> FlowResult<FlowPlayer> {
        drop(self.commands);
        self.task
            .await
            .map_err(|e| FlowError::Internal(anyhow::Error::new(e)))
    }
}

fn anyhow_closed() -> anyhow::Error {
    anyhow::anyhow!("player task has stopped")
}

async fn run(
    mut player: FlowPlayer,
    mut rx: mpsc::Receiver<Envelope>,
    state_tx: watch::Sender<PlayerState>,
    processed: Arc<AtomicU64>,
) -> FlowPlayer {
    let mut last: Option<(PlayerCommand, u64)> = None;

    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                if let Some((previous, finished_as)) = &last {
                    if *previous == envelope.command && envelope.observed < *finished_as {
                        debug!(command = ?envelope.command, "Coalesced repeated command");
                        continue;
                    }
                }

                if let Err(error) = apply(&mut player, envelope.command.clone()).await {
                    warn!(command = ?envelope.command, error = %error, "Player command rejected");
                }
                let finished_as = processed.fetch_add(1, Ordering::SeqCst) + 1;
                last = Some((envelope.command, finished_as));
                state_tx.send_replace(player.state());
            }
            settlement = player.wait_pending(), if player.is_suspended() => {
                if let Some(settlement) = settlement {
                    if let Err(error) = player.apply_settlement(settlement).await {
                        warn!(error = %error, "Settlement failed");
                    }
                    state_tx.send_replace(player.state());
                }
            }
        }
    }

    player
}

async fn apply(player: &mut FlowPlayer, command: PlayerCommand) -> FlowResult<PlayerState> {
    match command {
        PlayerCommand::Start => player.start().await,
        PlayerCommand::Advance { direction } => player.advance(direction).await,
        PlayerCommand::Click { button_id } => player.click(&button_id).await,
        PlayerCommand::Complete => player.complete().await,
        PlayerCommand::Skip => player.skip().await,
        PlayerCommand::RecordAnswer { field, value } => {
            player.record_answer(field, value);
            Ok(player.state())
        }
        PlayerCommand::Close => player.close(),
        PlayerCommand::Reset => player.reset(),
    }
}
