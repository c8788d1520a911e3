use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use server_api::auth::mint_access_token;
use shared::domain::UserId;
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
    },
    SetActive {
        user_id: i64,
        #[arg(long)]
        active: bool,
    },
    /// Prints an access token the server will accept for `user_id`.
    MintToken {
        user_id: i64,
        #[arg(long, default_value = "dev-secret-change-me")]
        jwt_secret: String,
        #[arg(long, default_value_t = 24)]
        ttl_hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { username } => {
            let user_id = storage.create_user(&username).await?;
            println!("created user_id={}", user_id.0);
        }
        Command::SetActive { user_id, active } => {
            storage.set_user_active(UserId(user_id), active).await?;
            println!("user_id={user_id} active={active}");
        }
        Command::MintToken {
            user_id,
            jwt_secret,
            ttl_hours,
        } => {
            let Some(user) = storage.load_user(UserId(user_id)).await? else {
                bail!("user_id={user_id} does not exist");
            };
            let token = mint_access_token(
                &jwt_secret,
                user.id,
                &user.username,
                chrono::Duration::hours(ttl_hours),
            )?;
            println!("{token}");
        }
    }

    Ok(())
}
