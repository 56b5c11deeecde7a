use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::{Message, MessageQuery},
};
use storage::Storage;

#[derive(Parser, Debug)]
#[command(about = "Maintenance commands for the chat message store")]
struct Cli {
    #[arg(long, env = "APP__DATABASE_URL", default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a new text message.
    Post {
        channel_id: String,
        user_id: String,
        content: String,
    },
    /// Print the first page of a channel.
    List {
        channel_id: String,
        #[arg(long, default_value_t = 100)]
        limit: u32,
        #[arg(long)]
        include_deleted: bool,
    },
    /// Replace the content of a message.
    Edit { message_id: String, content: String },
    /// Soft-delete a message.
    Delete { message_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::Post {
            channel_id,
            user_id,
            content,
        } => {
            let message = Message::text(
                MessageId::generate(),
                ChannelId::from(channel_id),
                UserId::from(user_id),
                content,
                Utc::now(),
            );
            storage.create_message(&message).await?;
            println!("created message_id={}", message.id);
        }
        Command::List {
            channel_id,
            limit,
            include_deleted,
        } => {
            let query = MessageQuery {
                channel_id: ChannelId::from(channel_id),
                include_deleted,
                limit,
            };
            for message in storage.list_channel_messages(&query).await? {
                println!(
                    "{}\t{}\t{}\t{}{}",
                    message.created_at.to_rfc3339(),
                    message.id,
                    message.user_id,
                    message.content,
                    if message.is_deleted { "\t(deleted)" } else { "" }
                );
            }
        }
        Command::Edit {
            message_id,
            content,
        } => {
            let message_id = MessageId::from(message_id);
            let Some(mut message) = storage.load_message(&message_id).await? else {
                bail!("message {message_id} not found");
            };
            message.content = content;
            message.updated_at = Utc::now();
            storage.update_message(&message).await?;
            println!("updated message_id={message_id}");
        }
        Command::Delete { message_id } => {
            let message_id = MessageId::from(message_id);
            if !storage.soft_delete_message(&message_id, Utc::now()).await? {
                bail!("message {message_id} not found or already deleted");
            }
            println!("deleted message_id={message_id}");
        }
    }

    Ok(())
}
