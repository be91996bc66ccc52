//! CLI subcommands and how each one maps onto the store.

use bazaar::{Store, TokenStore, ACCESS_TOKEN_KEY};
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::config::Config;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Fetch one page of a resource collection
  List {
    resource: String,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 10)]
    limit: u32,
  },
  /// Fetch a single entity
  Get { resource: String, id: String },
  /// Create an entity from a JSON object
  Create { resource: String, json: String },
  /// Apply a partial JSON update to an entity
  Update {
    resource: String,
    id: String,
    json: String,
  },
  /// Delete an entity
  Delete { resource: String, id: String },
  /// Manage the stored access token
  Token {
    #[command(subcommand)]
    action: TokenCommand,
  },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum TokenCommand {
  /// Store the bearer token sent with authenticated requests
  Set { value: String },
  /// Forget the stored token
  Clear,
  /// Print the stored token
  Show,
}

/// Parse a JSON request body given on the command line. Only objects are
/// accepted since every write endpoint takes one.
pub fn parse_body(json: &str) -> Result<Value> {
  let value: Value =
    serde_json::from_str(json).map_err(|e| eyre!("Invalid JSON body: {}", e))?;
  if !value.is_object() {
    return Err(eyre!("JSON body must be an object, got: {}", value));
  }
  Ok(value)
}

fn pretty<T: Serialize>(value: &T) -> Result<String> {
  serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))
}

/// Token commands only touch local storage and never need the store.
pub fn run_token(action: &TokenCommand, tokens: &dyn TokenStore) -> Result<String> {
  match action {
    TokenCommand::Set { value } => {
      tokens.set(ACCESS_TOKEN_KEY, value)?;
      info!("access token stored");
      Ok("Token stored".to_string())
    }
    TokenCommand::Clear => {
      tokens.remove(ACCESS_TOKEN_KEY)?;
      info!("access token cleared");
      Ok("Token cleared".to_string())
    }
    TokenCommand::Show => Ok(
      tokens
        .get(ACCESS_TOKEN_KEY)
        .unwrap_or_else(|| "No token stored".to_string()),
    ),
  }
}

/// Run a resource command against the store and render its result.
pub async fn run(command: &Command, store: &Store, config: &Config) -> Result<String> {
  match command {
    Command::List {
      resource,
      page,
      limit,
    } => {
      let result = store
        .resource::<Value>(config.resource(resource))
        .list(*page, *limit)
        .await?;
      pretty(&result.data)
    }
    Command::Get { resource, id } => {
      let result = store
        .resource::<Value>(config.resource(resource))
        .get_by_id(id.as_str())
        .await?;
      pretty(&result.data)
    }
    Command::Create { resource, json } => {
      let body = parse_body(json)?;
      let created = store
        .resource::<Value>(config.resource(resource))
        .create(&body)
        .await?;
      pretty(&created)
    }
    Command::Update { resource, id, json } => {
      let body = parse_body(json)?;
      let updated = store
        .resource::<Value>(config.resource(resource))
        .update(id.as_str(), &body)
        .await?;
      pretty(&updated)
    }
    Command::Delete { resource, id } => {
      store
        .resource::<Value>(config.resource(resource))
        .delete(id.as_str())
        .await?;
      Ok(format!("Deleted {} {}", resource, id))
    }
    Command::Token { action } => Err(eyre!("Token command {:?} does not use the store", action)),
  }
}
