use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::{process_socket, TlsAcceptor};
use tokio::net::TcpStream;

use crate::auth::AllotAuthSource;
use crate::engine::{now_ms, Engine};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct AllotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AllotQueryParser>,
}

impl AllotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AllotQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(engine, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertEvent {
                id,
                title,
                start,
                end,
                description,
            } => {
                engine
                    .create_event(id, title, Span::unchecked(start, end), description)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateEvent {
                id,
                title,
                start,
                end,
                description,
            } => {
                engine
                    .update_event(id, title, Span::unchecked(start, end), description)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteEvent { id } => {
                engine.delete_event(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertResource { id, name, kind } => {
                engine
                    .create_resource(id, name, kind)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource { id, name, kind } => {
                engine
                    .update_resource(id, name, kind)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertAllocation {
                id,
                event_id,
                resource_id,
            } => {
                engine
                    .create_allocation(id, event_id, resource_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::BatchInsertAllocations { allocations } => {
                let count = allocations.len();
                engine
                    .batch_create_allocations(allocations)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::UpdateAllocation {
                id,
                event_id,
                resource_id,
            } => {
                engine
                    .update_allocation(id, event_id, resource_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteAllocation { id } => {
                engine.delete_allocation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectEvents { from } => {
                let events = engine.list_events(from).await;
                Ok(vec![query_response(events_schema(), events, |enc, e| {
                    enc.encode_field(&e.id.to_string())?;
                    enc.encode_field(&e.title)?;
                    enc.encode_field(&e.span.start)?;
                    enc.encode_field(&e.span.end)?;
                    enc.encode_field(&e.description)
                })])
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                Ok(vec![query_response(resources_schema(), resources, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.name)?;
                    enc.encode_field(&r.kind)
                })])
            }
            Command::SelectAllocations => {
                let allocations = engine.list_allocations().await;
                Ok(vec![query_response(allocations_schema(), allocations, |enc, a| {
                    enc.encode_field(&a.id.to_string())?;
                    enc.encode_field(&a.event_id.to_string())?;
                    enc.encode_field(&a.resource_id.to_string())
                })])
            }
            Command::SelectConflicts => {
                let rows = engine.conflict_rows().await;
                Ok(vec![query_response(conflicts_schema(), rows, |enc, row| {
                    enc.encode_field(&row.conflict.first.to_string())?;
                    enc.encode_field(&row.conflict.second.to_string())?;
                    enc.encode_field(&row.conflict.resource_id.to_string())?;
                    enc.encode_field(&row.resource_name)?;
                    enc.encode_field(&row.first_title)?;
                    enc.encode_field(&row.second_title)
                })])
            }
            Command::SelectReport => {
                let rows = engine.report().await;
                Ok(vec![query_response(report_schema(), rows, |enc, row| {
                    enc.encode_field(&row.allocation_id.to_string())?;
                    enc.encode_field(&row.event_id.to_string())?;
                    enc.encode_field(&row.resource_id.to_string())?;
                    enc.encode_field(&row.event_title)?;
                    enc.encode_field(&row.span.map(|s| s.start))?;
                    enc.encode_field(&row.span.map(|s| s.end))?;
                    enc.encode_field(&row.resource_name)?;
                    enc.encode_field(&row.resource_kind)
                })])
            }
            Command::SelectDashboard => {
                let dashboard = engine.dashboard(now_ms()).await;
                Ok(vec![query_response(
                    dashboard_schema(),
                    dashboard_items(dashboard),
                    |enc, item| {
                        enc.encode_field(&item.item.to_string())?;
                        enc.encode_field(&item.value)?;
                        enc.encode_field(&item.event.as_ref().map(|e| e.id.to_string()))?;
                        enc.encode_field(&item.event.as_ref().map(|e| e.title.clone()))?;
                        enc.encode_field(&item.event.as_ref().map(|e| e.span.start))?;
                        enc.encode_field(&item.event.as_ref().map(|e| e.span.end))
                    },
                )])
            }
        }
    }
}

/// One row of the dashboard relation: a named total or an upcoming event.
struct DashboardItem {
    item: &'static str,
    value: Option<i64>,
    event: Option<Event>,
}

fn dashboard_items(dashboard: Dashboard) -> Vec<DashboardItem> {
    let total = |item, n: usize| DashboardItem {
        item,
        value: Some(n as i64),
        event: None,
    };
    let mut items = vec![
        total("total_events", dashboard.total_events),
        total("total_resources", dashboard.total_resources),
        total("total_allocations", dashboard.total_allocations),
    ];
    items.extend(dashboard.upcoming.into_iter().map(|e| DashboardItem {
        item: "upcoming",
        value: None,
        event: Some(e),
    }));
    items
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Schemas ──────────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn events_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("title"),
        int8("start"),
        int8("end"),
        text("description"),
    ]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name"), text("kind")]
}

fn allocations_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("event_id"), text("resource_id")]
}

fn conflicts_schema() -> Vec<FieldInfo> {
    vec![
        text("allocation_a"),
        text("allocation_b"),
        text("resource_id"),
        text("resource_name"),
        text("event_a_title"),
        text("event_b_title"),
    ]
}

fn report_schema() -> Vec<FieldInfo> {
    vec![
        text("allocation_id"),
        text("event_id"),
        text("resource_id"),
        text("event_title"),
        int8("start"),
        int8("end"),
        text("resource_name"),
        text("resource_kind"),
    ]
}

fn dashboard_schema() -> Vec<FieldInfo> {
    vec![
        text("item"),
        int8("value"),
        text("event_id"),
        text("title"),
        int8("start"),
        int8("end"),
    ]
}

/// Result schema of a statement, looked up from the relation after FROM.
/// Statements that return no rows get an empty schema.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower
        .split(|c: char| c.is_whitespace() || c == ';')
        .filter(|w| !w.is_empty());
    if words.next() != Some("select") {
        return vec![];
    }
    let relation = words.skip_while(|w| *w != "from").nth(1);
    match relation.map(|r| r.trim_matches('"')) {
        Some("events") => events_schema(),
        Some("resources") => resources_schema(),
        Some("allocations") => allocations_schema(),
        Some("conflicts") => conflicts_schema(),
        Some("report") => report_schema(),
        Some("dashboard") => dashboard_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for AllotHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AllotQueryParser;

#[async_trait]
impl QueryParser for AllotQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AllotHandler {
    type Statement = String;
    type QueryParser = AllotQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&engine, &sql).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Positions of `$N` placeholders outside quoted literals and identifiers,
/// as `(byte range, N)`. A doubled quote inside a literal closes and reopens
/// it, so escaped quotes need no special case.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            None => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Splice bound text-format values into the SQL in one left-to-right pass.
/// Values are quoted with `'` doubled and are never scanned again, so a value
/// containing `$1` stays literal. Placeholders without a value are left as is.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[last..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AllotFactory {
    handler: Arc<AllotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<AllotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AllotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = AllotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AllotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AllotFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    socket.set_nodelay(true)?;
    let factory = Arc::new(AllotFactory::new(tenant_manager, password));
    process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(schema: &[FieldInfo]) -> Vec<String> {
        schema.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM events"), 0);
        assert_eq!(count_params("DELETE FROM events WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO resources (id, name, kind) VALUES ($1, $3, $2)"),
            3
        );
        assert_eq!(count_params("SELECT $10"), 10);
    }

    #[test]
    fn count_params_skips_quoted_text() {
        assert_eq!(count_params("UPDATE resources SET name = 'Room $7' WHERE id = $1"), 1);
        assert_eq!(count_params("SELECT \"$3\" FROM events"), 0);
        assert_eq!(count_params("SELECT 'it''s $9', $2"), 2);
    }

    #[test]
    fn bound_value_with_placeholder_text_stays_literal() {
        let sql = "UPDATE resources SET name = $1, kind = $2 WHERE id = $3";
        let id = ulid::Ulid::new().to_string();
        let params = [Some("Room $1"), Some("room $2 $3"), Some(id.as_str())];
        let bound = bind_params(sql, &params);
        assert_eq!(
            bound,
            format!("UPDATE resources SET name = 'Room $1', kind = 'room $2 $3' WHERE id = '{id}'")
        );
        match sql::parse_sql(&bound).unwrap() {
            Command::UpdateResource { name, kind, .. } => {
                assert_eq!(name, "Room $1");
                assert_eq!(kind, "room $2 $3");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bind_escapes_quotes_and_handles_nulls() {
        let sql = "UPDATE events SET title = $1, description = $2 WHERE note = '$1'";
        let bound = bind_params(sql, &[Some("it's"), None]);
        assert_eq!(
            bound,
            "UPDATE events SET title = 'it''s', description = NULL WHERE note = '$1'"
        );
    }

    #[test]
    fn bind_keeps_ten_apart_from_one() {
        let params: Vec<Option<String>> = (1..=10).map(|i| Some(format!("v{i}"))).collect();
        assert_eq!(bind_params("SELECT $10, $1", &params), "SELECT 'v10', 'v1'");
        assert_eq!(bind_params("SELECT $0, $4", &params[..2]), "SELECT $0, $4");
    }

    #[test]
    fn result_schema_by_relation() {
        assert_eq!(
            names(&result_schema("SELECT * FROM conflicts")),
            vec![
                "allocation_a",
                "allocation_b",
                "resource_id",
                "resource_name",
                "event_a_title",
                "event_b_title"
            ]
        );
        assert_eq!(
            names(&result_schema("select * from events where start >= $1;")),
            vec!["id", "title", "start", "end", "description"]
        );
        assert_eq!(result_schema("SELECT * FROM report").len(), 8);
        assert_eq!(result_schema("SELECT * FROM dashboard").len(), 6);
    }

    #[test]
    fn result_schema_empty_for_writes() {
        assert!(result_schema("DELETE FROM events WHERE id = $1").is_empty());
        assert!(result_schema("INSERT INTO resources VALUES ($1, $2, $3)").is_empty());
        assert!(result_schema("SELECT * FROM nowhere").is_empty());
    }

    #[test]
    fn dashboard_items_totals_then_upcoming() {
        let event = Event {
            id: ulid::Ulid::new(),
            title: "Next".into(),
            span: Span::new(10, 20),
            description: None,
        };
        let items = dashboard_items(Dashboard {
            total_events: 4,
            total_resources: 2,
            total_allocations: 7,
            upcoming: vec![event],
        });
        let labels: Vec<_> = items.iter().map(|i| i.item).collect();
        assert_eq!(
            labels,
            vec!["total_events", "total_resources", "total_allocations", "upcoming"]
        );
        assert_eq!(items[2].value, Some(7));
        assert_eq!(items[3].value, None);
        assert_eq!(items[3].event.as_ref().map(|e| e.title.as_str()), Some("Next"));
    }
}
