use common::PersonaConfig;
use std::sync::Arc;
use tokio::select;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::delivery::{TelegramClient, Update};
use crate::scheduler::{shutdown_requested, Dispatcher, Target, Trigger};

const POLL_ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Chat commands understood by the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Register the chat for scheduled digests.
    Start,
    /// Run a cycle now and reply to this chat.
    Pulse,
}

/// Parse `/start`, `/pulse` and their `/cmd@botname` forms. Anything else is
/// not a command.
pub fn parse_command(text: &str) -> Option<Command> {
    let first = text.split_whitespace().next()?;
    let name = first.strip_prefix('/')?;
    let name = name.split('@').next().unwrap_or(name);
    match name.to_ascii_lowercase().as_str() {
        "start" => Some(Command::Start),
        "pulse" => Some(Command::Pulse),
        _ => None,
    }
}

/// Long-polls Telegram for commands and routes them to the dispatcher.
pub struct CommandLoop {
    client: TelegramClient,
    dispatcher: Arc<Dispatcher>,
    greeting: String,
    apology: String,
    poll_timeout_secs: u64,
}

impl CommandLoop {
    pub fn new(client: TelegramClient, dispatcher: Arc<Dispatcher>, persona: &PersonaConfig, poll_timeout_secs: u64) -> Self {
        Self {
            client,
            dispatcher,
            greeting: persona.greeting().to_string(),
            apology: persona.apology().to_string(),
            poll_timeout_secs,
        }
    }

    /// Poll until shutdown is requested. Poll failures are logged and retried
    /// after a short pause.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("commands: listening for chat commands");
        let mut offset: i64 = 0;

        loop {
            let polled = select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    info!("commands: shutdown requested, exiting loop");
                    break;
                }
                res = self.client.get_updates(offset, self.poll_timeout_secs) => res,
            };

            match polled {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        self.handle_update(&update).await;
                    }
                }
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "commands: poll failed");
                    select! {
                        _ = tokio::time::sleep(POLL_ERROR_PAUSE) => {},
                        _ = shutdown_requested(&mut shutdown) => {
                            info!("commands: shutdown requested, exiting loop");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Act on one update. Returns the command that was handled, if any.
    pub async fn handle_update(&self, update: &Update) -> Option<Command> {
        let message = update.message.as_ref()?;
        let chat_id = message.chat.id;
        let Some(command) = message.text.as_deref().and_then(parse_command) else {
            debug!(chat_id, "ignoring non-command message");
            return None;
        };

        info!(chat_id, ?command, "command received");
        match command {
            Command::Start => {
                if let Err(e) = self.dispatcher.recipients().register(chat_id).await {
                    error!(chat_id, error = %format!("{:#}", e), "failed to save recipients");
                }
                self.reply(chat_id, &self.greeting).await;
            }
            Command::Pulse => {
                if let Err(e) = self.dispatcher.run_cycle(Trigger::OnDemand, Target::Chat(chat_id)).await {
                    error!(chat_id, error = %format!("{:#}", e), "on-demand cycle failed");
                    self.reply(chat_id, &self.apology).await;
                }
            }
        }
        Some(command)
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.dispatcher.deliverer().deliver(chat_id, text).await {
            warn!(chat_id, error = %format!("{:#}", e), "reply failed");
        }
    }
}
