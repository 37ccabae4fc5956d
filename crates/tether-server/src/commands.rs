//! Command table: one handler per [`CommandKind`], each translating request
//! parameters into a provider call and the result into a response.

use crate::provider::Provider;
use std::future::Future;
use std::pin::Pin;
use tether_core::{ConnectionInfo, Param, TetherError, TetherResult};
use tether_protocol::{keys, CommandKind, Message};
use uuid::Uuid;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type Handler = for<'a> fn(&'a Provider, &'a Message) -> BoxFuture<'a, TetherResult<Message>>;

static HANDLERS: [(CommandKind, Handler); 11] = [
    (CommandKind::Login, login),
    (CommandKind::StartTransaction, start_transaction),
    (CommandKind::Commit, commit),
    (CommandKind::Rollback, rollback),
    (CommandKind::GetConnection, get_connection),
    (CommandKind::ReleaseConnection, release_connection),
    (CommandKind::ExecuteSelectStatement, execute_select),
    (
        CommandKind::ExecuteSelectStatementInTransaction,
        execute_select_in_transaction,
    ),
    (CommandKind::ExecuteCommandStatement, execute_command),
    (CommandKind::GetKey, get_key),
    (CommandKind::GetSqlStatement, get_sql_statement),
];

pub fn handler(kind: CommandKind) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, handler)| *handler)
}

pub async fn execute(provider: &Provider, request: &Message) -> TetherResult<Message> {
    let handler = request
        .kind()
        .and_then(handler)
        .ok_or_else(|| TetherError::ServerFault(format!("unknown command: {}", request.id)))?;
    handler(provider, request).await
}

fn params(request: &Message) -> TetherResult<Vec<Param>> {
    request.json_or_default(keys::PARAMS)
}

fn login<'a>(
    provider: &'a Provider,
    request: &'a Message,
) -> BoxFuture<'a, TetherResult<Message>> {
    Box::pin(async move {
        let info: ConnectionInfo = request.json(keys::CONNECTION_INFO)?;
        let session_id = provider.login(info).await?;
        Ok(request
            .reply(CommandKind::Login)
            .with(keys::SESSION_ID, session_id))
    })
}

fn start_transaction<'a>(
    provider: &'a Provider,
    request: &'a Message,
) -> BoxFuture<'a, TetherResult<Message>> {
    Box::pin(async move {
        let session_id: Uuid = request.parse(keys::SESSION_ID)?;
        let transaction_id = provider.start_transaction(session_id).await?;
        Ok(request
            .reply(CommandKind::StartTransaction)
            .with(keys::TRANSACTION_ID, transaction_id))
    })
}

fn commit<'a>(
    provider: &'a Provider,
    request: &'a Message,
) -> BoxFuture<'a, TetherResult<Message>> {
    Box::pin(async move {
        provider.commit(request.parse(keys::TRANSACTION_ID)?).await?;
        Ok(request.reply(CommandKind::Commit))
    })
}

fn rollback<'a>(
    provider: &'a Provider,
    request: &'a Message,
) -> BoxFuture<'a, TetherResult<Message>> {
    Box::pin(async move {
        provider.rollback(request.parse(keys::TRANSACTION_ID)?).await?;
        Ok(request.reply(CommandKind::Rollback))
    })
}

fn get_connection<'a>(
    provider: &'a Provider,
    request: &'a Message,
) -> BoxFuture<'a, TetherResult<Message>> {
    Box::pin(async move {
        let connection_id = provider
            .get_connection(request.parse(keys::SESSION_ID)?)
            .await?;
        Ok(request
            .reply(CommandKind::GetConnection)
            .with(keys::CONNECTION_ID, connection_id))
    })
}

fn release_connection<'a>(
    provider: &'a Provider,
    request: &'a Message,
) -> BoxFuture<'a, TetherResult<Message>> {
    Box::pin(async move {
        provider
            .release_connection(request.parse(keys::CONNECTION_ID)?)
            .await?;
        Ok(request.reply(CommandKind::ReleaseConnection))
    })
}

fn execute_select<'a>(
    provider: &'a Provider,
    request: &'a Message,
) -> BoxFuture<'a, TetherResult<Message>> {
    Box::pin(async move {
        let result = provider
            .execute_select(
                request.parse(keys::SESSION_ID)?,
                request.parse_opt(keys::CONNECTION_ID)?,
                request.require(keys::STATEMENT)?,
                &params(request)?,
            )
            .await?;
        request
            .reply(CommandKind::ExecuteSelectStatement)
            .with_json(keys::RESULT, &result)
    })
}

fn execute_select_in_transaction<'a>(
    provider: &'a Provider,
    request: &'a Message,
) -> BoxFuture<'a, TetherResult<Message>> {
    Box::pin(async move {
        let result = provider
            .execute_select_in_transaction(
                request.parse(keys::TRANSACTION_ID)?,
                request.require(keys::STATEMENT)?,
                &params(request)?,
            )
            .await?;
        request
            .reply(CommandKind::ExecuteSelectStatementInTransaction)
            .with_json(keys::RESULT, &result)
    })
}

fn execute_command<'a>(
    provider: &'a Provider,
    request: &'a Message,
) -> BoxFuture<'a, TetherResult<Message>> {
    Box::pin(async move {
        let rows_affected = provider
            .execute_command(
                request.parse(keys::SESSION_ID)?,
                request.parse_opt(keys::TRANSACTION_ID)?,
                request.parse_opt(keys::CONNECTION_ID)?,
                request.require(keys::STATEMENT)?,
                &params(request)?,
            )
            .await?;
        Ok(request
            .reply(CommandKind::ExecuteCommandStatement)
            .with(keys::ROWS_AFFECTED, rows_affected))
    })
}

fn get_key<'a>(
    provider: &'a Provider,
    request: &'a Message,
) -> BoxFuture<'a, TetherResult<Message>> {
    Box::pin(async move {
        let key = provider
            .get_key(request.require(keys::KEY_ID)?, request.parse(keys::SESSION_ID)?)
            .await?;
        request.reply(CommandKind::GetKey).with_json(keys::KEY, &key)
    })
}

fn get_sql_statement<'a>(
    provider: &'a Provider,
    request: &'a Message,
) -> BoxFuture<'a, TetherResult<Message>> {
    Box::pin(async move {
        let statement = provider
            .get_sql_statement(
                request.require(keys::STATEMENT_ID)?,
                request.parse(keys::SESSION_ID)?,
            )
            .await?;
        Ok(request
            .reply(CommandKind::GetSqlStatement)
            .with(keys::STATEMENT, statement))
    })
}
