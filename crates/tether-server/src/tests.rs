#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::drivers::{builtin_registry, MemoryFactory};
    use crate::provider::Provider;
    use crate::server::Server;
    use async_trait::async_trait;
    use std::io::Write;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tether_core::{
        Connection, ConnectionFactory, ConnectionInfo, DataValue, DriverRegistry, Param,
        ResultSet, TetherError, TetherResult,
    };
    use tether_pool::{ConnectionPool, PoolConfig};
    use tether_protocol::client::send_request;
    use tether_protocol::codec;
    use tether_protocol::packet::{split_packets, DEFAULT_BUFFER_SIZE};
    use tether_protocol::{keys, CommandKind, ExceptionReport, Message, Reassembler};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use uuid::Uuid;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        config.server.read_timeout_ms = 5_000;
        config.server.close_timeout_ms = 1_000;
        config
    }

    async fn start_server(factory: &MemoryFactory) -> (Server, SocketAddr) {
        let registry = DriverRegistry::new().with("memory", Arc::new(factory.clone()));
        let server = Server::new(&test_config(), registry);
        let addr = server.start().await.expect("start server");
        (server, addr)
    }

    async fn call(addr: SocketAddr, request: &Message) -> Message {
        let response = send_request(addr, request, DEFAULT_BUFFER_SIZE, Duration::from_secs(5))
            .await
            .expect("exchange");
        assert_eq!(response.guid, request.guid, "response must echo the request guid");
        response
    }

    fn exception_kind(response: &Message) -> String {
        ExceptionReport::from_message(response)
            .expect("exception response")
            .kind
    }

    fn login_request(database: &str) -> Message {
        Message::new(CommandKind::Login)
            .with_json(keys::CONNECTION_INFO, &ConnectionInfo::new("memory", database))
            .expect("encode info")
    }

    async fn login(addr: SocketAddr, database: &str) -> Uuid {
        let response = call(addr, &login_request(database)).await;
        assert_eq!(response.kind(), Some(CommandKind::Login), "{response:?}");
        response.parse(keys::SESSION_ID).expect("session id")
    }

    #[tokio::test]
    async fn login_is_idempotent_over_tcp() {
        let factory = MemoryFactory::new();
        let (server, addr) = start_server(&factory).await;

        let first = login(addr, "sales").await;
        let second = login(addr, "sales").await;
        let other = login(addr, "hr").await;

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(server.provider().pool().session_count(), 2);
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn transaction_lifecycle() {
        let factory = MemoryFactory::new();
        let (server, addr) = start_server(&factory).await;
        let session = login(addr, "orders").await;

        let begun = call(
            addr,
            &Message::new(CommandKind::StartTransaction).with(keys::SESSION_ID, session),
        )
        .await;
        let tx: Uuid = begun.parse(keys::TRANSACTION_ID).expect("transaction id");

        let insert = Message::new(CommandKind::ExecuteCommandStatement)
            .with(keys::SESSION_ID, session)
            .with(keys::TRANSACTION_ID, tx)
            .with(keys::STATEMENT, "INSERT INTO orders VALUES (@id)")
            .with_json(keys::PARAMS, &vec![Param::token("id", DataValue::Int64(7))])
            .expect("params");
        let inserted = call(addr, &insert).await;
        assert_eq!(inserted.get(keys::ROWS_AFFECTED), Some("1"));
        assert!(factory.journal("orders").is_empty(), "uncommitted work is private");

        let in_tx = call(
            addr,
            &Message::new(CommandKind::ExecuteSelectStatementInTransaction)
                .with(keys::TRANSACTION_ID, tx)
                .with(keys::STATEMENT, "SELECT * FROM orders"),
        )
        .await;
        let rows: ResultSet = in_tx.json(keys::RESULT).expect("result");
        assert_eq!(rows.rows.len(), 1);

        let committed = call(
            addr,
            &Message::new(CommandKind::Commit).with(keys::TRANSACTION_ID, tx),
        )
        .await;
        assert_eq!(committed.kind(), Some(CommandKind::Commit));
        assert_eq!(
            factory.journal("orders"),
            vec!["INSERT INTO orders VALUES (7)".to_string()]
        );
        let states = server.provider().pool().snapshot();
        assert!(states.iter().all(|s| s.idle && s.transaction_id.is_none()));

        let rolled_back = call(
            addr,
            &Message::new(CommandKind::Rollback).with(keys::TRANSACTION_ID, tx),
        )
        .await;
        assert_eq!(exception_kind(&rolled_back), "MissingParameter");
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn checked_out_connection_runs_statements() {
        let factory = MemoryFactory::new();
        let (server, addr) = start_server(&factory).await;
        let session = login(addr, "stock").await;

        let got = call(
            addr,
            &Message::new(CommandKind::GetConnection).with(keys::SESSION_ID, session),
        )
        .await;
        let connection: Uuid = got.parse(keys::CONNECTION_ID).expect("connection id");

        call(
            addr,
            &Message::new(CommandKind::ExecuteCommandStatement)
                .with(keys::SESSION_ID, session)
                .with(keys::CONNECTION_ID, connection)
                .with(keys::STATEMENT, "UPDATE stock SET qty = qty - 1"),
        )
        .await;
        let selected = call(
            addr,
            &Message::new(CommandKind::ExecuteSelectStatement)
                .with(keys::SESSION_ID, session)
                .with(keys::CONNECTION_ID, connection)
                .with(keys::STATEMENT, "SELECT * FROM stock"),
        )
        .await;
        let rows: ResultSet = selected.json(keys::RESULT).expect("result");
        assert_eq!(
            rows.rows[0].values,
            vec![DataValue::String("UPDATE stock SET qty = qty - 1".into())]
        );

        let released = call(
            addr,
            &Message::new(CommandKind::ReleaseConnection).with(keys::CONNECTION_ID, connection),
        )
        .await;
        assert_eq!(released.kind(), Some(CommandKind::ReleaseConnection));
        assert_eq!(server.provider().pool().live_connections(session), 1);
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn unknown_command_gets_exception() {
        let factory = MemoryFactory::new();
        let (server, addr) = start_server(&factory).await;

        let mut request = Message::new(CommandKind::Login);
        request.id = 42;
        let response = call(addr, &request).await;
        let report = ExceptionReport::from_message(&response).expect("exception");
        assert_eq!(report.kind, "ServerFault");
        assert!(report.message.contains("unknown command"), "{report:?}");
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn missing_parameter_is_reported() {
        let factory = MemoryFactory::new();
        let (server, addr) = start_server(&factory).await;

        let response = call(addr, &Message::new(CommandKind::StartTransaction)).await;
        let report = ExceptionReport::from_message(&response).expect("exception");
        assert_eq!(report.kind, "MissingParameter");
        assert_eq!(report.source, "StartTransaction");
        assert_eq!(report.trace.lines().count(), 2, "{}", report.trace);
        server.shutdown().await.expect("shutdown");
    }

    async fn raw_exchange(addr: SocketAddr, frame: &[u8]) -> Message {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        for packet in split_packets(frame, DEFAULT_BUFFER_SIZE).expect("split") {
            stream.write_all(&packet).await.expect("write");
        }
        let mut reassembler = Reassembler::new();
        let mut buf = vec![0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.expect("read");
            assert!(n > 0, "server closed without responding");
            let frames = reassembler.push(&buf[..n]).expect("reassemble");
            if let Some(frame) = frames.into_iter().next() {
                return codec::decode(&frame).expect("decode response");
            }
        }
    }

    #[tokio::test]
    async fn corrupted_frame_gets_checksum_exception() {
        let factory = MemoryFactory::new();
        let (server, addr) = start_server(&factory).await;

        let mut frame = codec::encode(&login_request("sales")).expect("encode").to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let response = raw_exchange(addr, &frame).await;
        assert_eq!(exception_kind(&response), "ChecksumMismatch");
        assert_eq!(server.provider().pool().session_count(), 0);
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn oversized_messages_travel_in_packets() {
        let factory = MemoryFactory::new();
        let (server, addr) = start_server(&factory).await;
        let session = login(addr, "blobs").await;

        let statement = format!("INSERT INTO blobs VALUES ('{}')", "x".repeat(40_000));
        call(
            addr,
            &Message::new(CommandKind::ExecuteCommandStatement)
                .with(keys::SESSION_ID, session)
                .with(keys::STATEMENT, &statement),
        )
        .await;
        let selected = call(
            addr,
            &Message::new(CommandKind::ExecuteSelectStatement)
                .with(keys::SESSION_ID, session)
                .with(keys::STATEMENT, "SELECT * FROM blobs"),
        )
        .await;
        let rows: ResultSet = selected.json(keys::RESULT).expect("result");
        assert_eq!(rows.rows[0].values, vec![DataValue::String(statement)]);
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn reset_peer_does_not_disturb_other_peers() {
        let factory = MemoryFactory::new();
        let (server, addr) = start_server(&factory).await;
        let session = login(addr, "bulk").await;
        let statement = format!("INSERT INTO bulk VALUES ('{}')", "y".repeat(200_000));
        call(
            addr,
            &Message::new(CommandKind::ExecuteCommandStatement)
                .with(keys::SESSION_ID, session)
                .with(keys::STATEMENT, &statement),
        )
        .await;
        let select = || {
            Message::new(CommandKind::ExecuteSelectStatement)
                .with(keys::SESSION_ID, session)
                .with(keys::STATEMENT, "SELECT * FROM bulk")
        };

        let frame = codec::encode(&select()).expect("encode");
        let mut abandoned = TcpStream::connect(addr).await.expect("connect");
        for packet in split_packets(&frame, DEFAULT_BUFFER_SIZE).expect("split") {
            abandoned.write_all(&packet).await.expect("write");
        }
        abandoned.set_linger(Some(Duration::ZERO)).expect("linger");
        drop(abandoned);

        let selected = call(addr, &select()).await;
        let rows: ResultSet = selected.json(keys::RESULT).expect("result");
        assert_eq!(rows.rows[0].values, vec![DataValue::String(statement)]);
        assert_eq!(login(addr, "bulk").await, session);
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_key_requests_get_distinct_values() {
        let factory = MemoryFactory::new();
        let (server, addr) = start_server(&factory).await;
        let session = login(addr, "keys").await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            tasks.push(tokio::spawn(async move {
                let request = Message::new(CommandKind::GetKey)
                    .with(keys::SESSION_ID, session)
                    .with(keys::KEY_ID, "invoice");
                let response = call(addr, &request).await;
                response.json::<DataValue>(keys::KEY).expect("key")
            }));
        }
        let mut values = Vec::new();
        for task in tasks {
            match task.await.expect("task") {
                DataValue::Int64(v) => values.push(v),
                other => panic!("unexpected key {other:?}"),
            }
        }
        values.sort_unstable();
        assert_eq!(values, (1..=8).collect::<Vec<i64>>());
        assert!(server.provider().pool().live_connections(session) <= 10);
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn failed_login_is_invalid_database() {
        let factory = MemoryFactory::new();
        let (server, addr) = start_server(&factory).await;

        let response = call(addr, &login_request("")).await;
        assert_eq!(exception_kind(&response), "InvalidDatabase");
        assert_eq!(server.provider().pool().session_count(), 0);

        let unknown = Message::new(CommandKind::Login)
            .with_json(keys::CONNECTION_INFO, &ConnectionInfo::new("oracle", "hr"))
            .expect("encode info");
        assert_eq!(exception_kind(&call(addr, &unknown).await), "InvalidDatabase");
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let factory = MemoryFactory::new();
        let (server, addr) = start_server(&factory).await;
        assert_eq!(server.start().await.expect("restart"), addr);
        server.shutdown().await.expect("shutdown");
        server.shutdown().await.expect("second shutdown");
    }

    fn provider() -> Provider {
        Provider::new(ConnectionPool::new(PoolConfig::default(), builtin_registry()))
    }

    #[tokio::test]
    async fn release_with_open_transaction_is_rejected() {
        let provider = provider();
        let session = provider
            .login(ConnectionInfo::new("memory", "ledger"))
            .await
            .expect("login");
        let tx = provider.start_transaction(session).await.expect("begin");
        let connection = provider
            .pool()
            .connection_by_transaction_id(tx)
            .expect("connection")
            .connection_id();

        let err = provider
            .release_connection(connection)
            .await
            .expect_err("must refuse");
        assert!(matches!(err, TetherError::InvalidState(_)));

        provider.rollback(tx).await.expect("rollback");
        let err = provider
            .release_connection(connection)
            .await
            .expect_err("rollback already returned it");
        assert!(matches!(err, TetherError::InvalidState(_)));
    }

    #[tokio::test]
    async fn only_checked_out_connections_can_be_released() {
        let provider = provider();
        let session = provider
            .login(ConnectionInfo::new("memory", "ledger"))
            .await
            .expect("login");
        let connection = provider.get_connection(session).await.expect("connection");
        provider
            .release_connection(connection)
            .await
            .expect("release");

        let err = provider
            .release_connection(connection)
            .await
            .expect_err("already idle");
        assert!(matches!(err, TetherError::InvalidState(_)));
        let unknown = provider.release_connection(Uuid::new_v4()).await;
        assert!(matches!(unknown, Err(TetherError::MissingParameter(_))));
    }

    /// Driver with a configurable slow or refused open and a rollback that
    /// always fails.
    #[derive(Clone, Default)]
    struct Brittle {
        open_delay: Duration,
        refuse_open: bool,
    }

    struct BrittleConnection(Brittle);

    #[async_trait]
    impl Connection for BrittleConnection {
        async fn open(&mut self) -> TetherResult<()> {
            tokio::time::sleep(self.0.open_delay).await;
            if self.0.refuse_open {
                return Err(TetherError::driver("bad password"));
            }
            Ok(())
        }
        async fn close(&mut self) -> TetherResult<()> {
            Ok(())
        }
        async fn start_transaction(&mut self) -> TetherResult<()> {
            Ok(())
        }
        async fn commit(&mut self) -> TetherResult<()> {
            Ok(())
        }
        async fn rollback(&mut self) -> TetherResult<()> {
            Err(TetherError::driver("connection reset during rollback"))
        }
        async fn execute_select(&mut self, _: &str, _: &[Param]) -> TetherResult<ResultSet> {
            Ok(ResultSet::default())
        }
        async fn execute_command(&mut self, _: &str, _: &[Param]) -> TetherResult<u64> {
            Ok(0)
        }
        async fn get_key(&mut self, _: &str) -> TetherResult<DataValue> {
            Ok(DataValue::Int64(0))
        }
    }

    impl ConnectionFactory for Brittle {
        fn create(&self, _: &ConnectionInfo) -> TetherResult<Box<dyn Connection>> {
            Ok(Box::new(BrittleConnection(self.clone())))
        }
    }

    fn brittle_provider(brittle: Brittle) -> Provider {
        let registry = DriverRegistry::new().with("brittle", Arc::new(brittle));
        Provider::new(ConnectionPool::new(PoolConfig::default(), registry))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_logins_wait_for_the_failed_validation() {
        let provider = brittle_provider(Brittle {
            open_delay: Duration::from_millis(100),
            refuse_open: true,
        });
        let info = ConnectionInfo::new("brittle", "vault");
        let (first, second) = tokio::join!(provider.login(info.clone()), provider.login(info));

        assert!(matches!(first, Err(TetherError::InvalidDatabase(_))), "{first:?}");
        assert!(matches!(second, Err(TetherError::InvalidDatabase(_))), "{second:?}");
        assert_eq!(provider.pool().session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_logins_share_a_slow_validation() {
        let provider = brittle_provider(Brittle {
            open_delay: Duration::from_millis(100),
            refuse_open: false,
        });
        let info = ConnectionInfo::new("brittle", "vault");
        let (first, second) = tokio::join!(provider.login(info.clone()), provider.login(info));

        let session = first.expect("first login");
        assert_eq!(second.expect("second login"), session);
        provider
            .start_transaction(session)
            .await
            .expect("session is usable");
    }

    #[tokio::test]
    async fn failed_rollback_still_frees_the_connection() {
        let provider = brittle_provider(Brittle::default());
        let session = provider
            .login(ConnectionInfo::new("brittle", "vault"))
            .await
            .expect("login");
        let tx = provider.start_transaction(session).await.expect("begin");

        provider
            .rollback(tx)
            .await
            .expect("rollback failures are logged, not returned");
        assert!(provider.pool().connection_by_transaction_id(tx).is_none());
        let states = provider.pool().snapshot();
        assert_eq!(states.len(), 1);
        assert!(states[0].idle && states[0].transaction_id.is_none());
    }

    #[tokio::test]
    async fn checked_out_connection_is_bound_to_its_session() {
        let provider = provider();
        let mine = provider
            .login(ConnectionInfo::new("memory", "a"))
            .await
            .expect("login");
        let theirs = provider
            .login(ConnectionInfo::new("memory", "b"))
            .await
            .expect("login");
        let connection = provider.get_connection(mine).await.expect("connection");

        let err = provider
            .execute_command(theirs, None, Some(connection), "DELETE FROM t", &[])
            .await
            .expect_err("foreign connection");
        assert!(matches!(err, TetherError::InvalidState(_)));
    }

    #[tokio::test]
    async fn sql_statements_come_from_the_session_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"
            [customer_by_id]
            default = "SELECT * FROM customer WHERE id = @id"
            mssql = "SELECT TOP 1 * FROM customer WHERE id = @id"
            "#
        )
        .expect("write statements");

        let provider = provider();
        let mut info = ConnectionInfo::new("memory", "crm");
        info.statement_file_type = Some("toml".into());
        info.statement_file_name = Some(file.path().to_string_lossy().into_owned());
        info.statement_language = Some("mssql".into());
        let session = provider.login(info).await.expect("login");

        assert_eq!(
            provider
                .get_sql_statement("customer_by_id", session)
                .await
                .expect("statement"),
            "SELECT TOP 1 * FROM customer WHERE id = @id"
        );
        let missing = provider.get_sql_statement("nope", session).await;
        assert!(matches!(missing, Err(TetherError::MissingParameter(_))));
    }

    #[tokio::test]
    async fn keys_increase_per_generator() {
        let provider = provider();
        let session = provider
            .login(ConnectionInfo::new("memory", "seq"))
            .await
            .expect("login");
        assert_eq!(
            provider.get_key("order", session).await.expect("key"),
            DataValue::Int64(1)
        );
        assert_eq!(
            provider.get_key("order", session).await.expect("key"),
            DataValue::Int64(2)
        );
        let states = provider.pool().snapshot();
        assert!(states.iter().all(|s| s.idle), "ad hoc connections go back idle");
    }
}
