use std::error::Error;

use brainstorm_sdk::channel::binding::{SessionBinding, SessionUpdate};
use brainstorm_sdk::channel::manager::ChannelManager;
use brainstorm_sdk::session_api::SessionApiClient;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let session_id: u64 = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(1);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let api = SessionApiClient::new()?;
        let session = api.get_session(session_id).await?;
        println!(
            "observing session {} ({}) — round {}/{}",
            session.id, session.title, session.current_round, session.max_rounds
        );

        let mut binding = SessionBinding::new(ChannelManager::new());
        let mut updates = binding.bind(session_id).await?;

        while let Some(update) = updates.recv().await {
            match update {
                SessionUpdate::MessageReceived(message) => {
                    let author = message.llm_name.as_deref().unwrap_or("user");
                    println!("[{author}] {}", message.content);
                }
                SessionUpdate::TypingStarted(typing) => {
                    println!("… {} is typing", typing.llm_name);
                }
                SessionUpdate::ConsensusChanged(consensus) => {
                    println!("consensus at {:.1}%", consensus.consensus_percentage);
                }
                SessionUpdate::RoundAdvanced(round) => {
                    println!("round {} started", round.current_round);
                }
                SessionUpdate::Completed(done) => {
                    if let Some(summary) = done.summary {
                        println!("session completed: {summary}");
                    } else {
                        println!("session completed");
                    }
                    break;
                }
                _ => {}
            }
        }

        binding.release();
        Ok::<(), Box<dyn Error>>(())
    })
}
