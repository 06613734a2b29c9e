use std::error::Error;

use brainstorm_sdk::channel::binding::{SessionBinding, SessionUpdate};
use brainstorm_sdk::channel::manager::ChannelManager;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let session_id: u64 = args.next().map(|arg| arg.parse()).transpose()?.unwrap_or(1);
    let content = args.next().unwrap_or_else(|| "hello from the sdk".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut binding = SessionBinding::new(ChannelManager::new());
        let mut updates = binding.bind(session_id).await?;

        binding.send_chat_message(&content);
        println!("sent to session {session_id}: {content}");

        // Wait for the broadcast echo so the send is visibly through.
        while let Some(update) = updates.recv().await {
            if let SessionUpdate::MessageReceived(message) = update {
                println!("broadcast: [{}] {}",
                    message.llm_name.as_deref().unwrap_or("user"),
                    message.content
                );
                break;
            }
        }

        binding.release();
        Ok::<(), Box<dyn Error>>(())
    })
}
