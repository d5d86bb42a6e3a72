use crate::budget::SizeBudgetMonitor;
use crate::chunk;
use crate::continuation::{ContinuationToken, Cursor, OperationKind, TokenStore};
use crate::error::EngineError;
use crate::fs as pagefs;
use crate::protocol::{Request, Response};
use crate::write::{self, WriteMode, WriteRequest};
use anyhow::{anyhow, Result};
use base64::Engine as _;
use opentelemetry::global;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info_span, Span};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug)]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

impl std::fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for ProtocolError {}

#[derive(Clone, Debug)]
pub struct RootConfig {
	pub path_canon: PathBuf,
	pub display: String,
	pub default: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub roots: Vec<RootConfig>,
	pub default_root: PathBuf,
	pub default_root_canon: PathBuf,
	pub allowed_roots: Vec<PathBuf>,
	pub allow_escape: bool,
	pub response_max_bytes: Option<usize>,
	pub read_max_line_bytes: Option<usize>,
	pub write_chunk_size: usize,
	pub write_retry_attempts: u32,
	pub write_backup: bool,
	pub token_ttl_secs: Option<u64>,
	pub token_capacity: Option<usize>,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

pub fn load_config() -> Result<Config> {
	let mut root: Option<String> = None;
	let mut allowed_roots_raw: Vec<String> = Vec::new();
	let mut allow_escape = false;
	let mut response_max_bytes: Option<usize> = Some(50 * 1024);
	let mut read_max_line_bytes: Option<usize> = Some(25 * 1024);
	let mut write_chunk_size: usize = write::DEFAULT_CHUNK_SIZE;
	let mut write_retry_attempts: u32 = write::DEFAULT_RETRY_ATTEMPTS;
	let mut write_backup = true;
	let mut token_ttl_secs: Option<u64> = Some(900);
	let mut token_capacity: Option<usize> = Some(256);
	let mut otel_enabled = true;
	let mut otel_endpoint = String::from("http://127.0.0.1:4317");
	let mut otel_service_name = String::from("mcp-pagefs");
	let mut args = std::env::args().skip(1);
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--root" => {
				let value = args.next().ok_or_else(|| anyhow!("--root requires a value"))?;
				root = Some(value);
			}
			"--allow-root" => {
				let value = args.next().ok_or_else(|| anyhow!("--allow-root requires a value"))?;
				if !value.trim().is_empty() {
					allowed_roots_raw.push(value);
				}
			}
			"--allow-escape" => {
				allow_escape = true;
			}
			"--response-max-bytes" => {
				let value = args.next().ok_or_else(|| anyhow!("--response-max-bytes requires a value"))?;
				response_max_bytes = parse_byte_limit(&value, "--response-max-bytes")?;
			}
			"--read-max-line-bytes" => {
				let value = args.next().ok_or_else(|| anyhow!("--read-max-line-bytes requires a value"))?;
				read_max_line_bytes = parse_byte_limit(&value, "--read-max-line-bytes")?;
			}
			"--write-chunk-size" => {
				let value = args.next().ok_or_else(|| anyhow!("--write-chunk-size requires a value"))?;
				let parsed = parse_usize(&value, "--write-chunk-size")?;
				if parsed == 0 {
					return Err(anyhow!("--write-chunk-size must be greater than 0"));
				}
				write_chunk_size = parsed;
			}
			"--write-retry-attempts" => {
				let value = args.next().ok_or_else(|| anyhow!("--write-retry-attempts requires a value"))?;
				write_retry_attempts = parse_usize(&value, "--write-retry-attempts")? as u32;
			}
			"--write-backup" => {
				let value = args.next().ok_or_else(|| anyhow!("--write-backup requires a value"))?;
				write_backup = parse_bool(&value, "--write-backup")?;
			}
			"--token-ttl-secs" => {
				let value = args.next().ok_or_else(|| anyhow!("--token-ttl-secs requires a value"))?;
				let parsed = parse_usize(&value, "--token-ttl-secs")?;
				token_ttl_secs = if parsed == 0 {
					None
				}
				else {
					Some(parsed as u64)
				};
			}
			"--token-capacity" => {
				let value = args.next().ok_or_else(|| anyhow!("--token-capacity requires a value"))?;
				token_capacity = parse_byte_limit(&value, "--token-capacity")?;
			}
			"--otel-enabled" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-enabled requires a value"))?;
				otel_enabled = parse_bool(&value, "--otel-enabled")?;
			}
			"--otel-endpoint" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-endpoint requires a value"))?;
				otel_endpoint = value;
			}
			"--otel-service-name" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-service-name requires a value"))?;
				otel_service_name = value;
			}
			_ => return Err(anyhow!("unknown argument: {}", arg)),
		}
	}
	if root.is_none() {
		if let Ok(env_root) = std::env::var("PAGEFS_ROOT") {
			if !env_root.trim().is_empty() {
				root = Some(env_root);
			}
		}
	}
	if let Ok(env_roots) = std::env::var("PAGEFS_ALLOWED_ROOTS") {
		for value in env_roots.split(',') {
			let trimmed = value.trim();
			if !trimmed.is_empty() {
				allowed_roots_raw.push(trimmed.to_string());
			}
		}
	}
	if !allow_escape {
		if let Ok(env_allow) = std::env::var("PAGEFS_ALLOW_ESCAPE") {
			let value = env_allow.to_lowercase();
			allow_escape = value == "1" || value == "true" || value == "yes";
		}
	}
	if let Ok(env_limit) = std::env::var("PAGEFS_RESPONSE_MAX_BYTES") {
		if !env_limit.trim().is_empty() {
			response_max_bytes = parse_byte_limit(&env_limit, "PAGEFS_RESPONSE_MAX_BYTES")?;
		}
	}
	if let Ok(env_limit) = std::env::var("PAGEFS_READ_MAX_LINE_BYTES") {
		if !env_limit.trim().is_empty() {
			read_max_line_bytes = parse_byte_limit(&env_limit, "PAGEFS_READ_MAX_LINE_BYTES")?;
		}
	}
	if let Ok(env_limit) = std::env::var("PAGEFS_WRITE_CHUNK_SIZE") {
		if !env_limit.trim().is_empty() {
			let parsed = parse_usize(&env_limit, "PAGEFS_WRITE_CHUNK_SIZE")?;
			if parsed > 0 {
				write_chunk_size = parsed;
			}
		}
	}
	if let Ok(env_limit) = std::env::var("PAGEFS_WRITE_RETRY_ATTEMPTS") {
		if !env_limit.trim().is_empty() {
			write_retry_attempts = parse_usize(&env_limit, "PAGEFS_WRITE_RETRY_ATTEMPTS")? as u32;
		}
	}
	if let Ok(env_backup) = std::env::var("PAGEFS_WRITE_BACKUP") {
		if !env_backup.trim().is_empty() {
			write_backup = parse_bool(&env_backup, "PAGEFS_WRITE_BACKUP")?;
		}
	}
	if let Ok(env_ttl) = std::env::var("PAGEFS_TOKEN_TTL_SECS") {
		if !env_ttl.trim().is_empty() {
			let parsed = parse_usize(&env_ttl, "PAGEFS_TOKEN_TTL_SECS")?;
			token_ttl_secs = if parsed == 0 {
				None
			}
			else {
				Some(parsed as u64)
			};
		}
	}
	if let Ok(env_capacity) = std::env::var("PAGEFS_TOKEN_CAPACITY") {
		if !env_capacity.trim().is_empty() {
			token_capacity = parse_byte_limit(&env_capacity, "PAGEFS_TOKEN_CAPACITY")?;
		}
	}
	if let Ok(env_enabled) = std::env::var("PAGEFS_OTEL_ENABLED") {
		if !env_enabled.trim().is_empty() {
			otel_enabled = parse_bool(&env_enabled, "PAGEFS_OTEL_ENABLED")?;
		}
	}
	if let Ok(env_endpoint) = std::env::var("PAGEFS_OTEL_ENDPOINT") {
		if !env_endpoint.trim().is_empty() {
			otel_endpoint = env_endpoint;
		}
	}
	if let Ok(env_service) = std::env::var("PAGEFS_OTEL_SERVICE_NAME") {
		if !env_service.trim().is_empty() {
			otel_service_name = env_service;
		}
	}
	let cwd = std::env::current_dir()?;
	let root = root.unwrap_or_else(|| cwd.to_string_lossy().to_string());
	let root_path = absolute_path(&cwd, &root);
	let root_canon = root_path
		.canonicalize()
		.map_err(|err| anyhow!("root {} not accessible: {}", root_path.display(), err))?;
	let mut roots = vec![RootConfig {
		path_canon: root_canon.clone(),
		display: root_path.to_string_lossy().to_string(),
		default: true,
	}];
	let mut allowed_roots = Vec::new();
	for raw in allowed_roots_raw {
		let path = absolute_path(&cwd, &raw);
		let canon = path.canonicalize().unwrap_or_else(|_| path.clone());
		allowed_roots.push(canon.clone());
		roots.push(RootConfig {
			path_canon: canon,
			display: path.to_string_lossy().to_string(),
			default: false,
		});
	}
	Ok(Config {
		roots,
		default_root: root_path,
		default_root_canon: root_canon,
		allowed_roots,
		allow_escape,
		response_max_bytes,
		read_max_line_bytes,
		write_chunk_size,
		write_retry_attempts,
		write_backup,
		token_ttl_secs,
		token_capacity,
		otel_enabled,
		otel_endpoint,
		otel_service_name,
		session_id: uuid::Uuid::new_v4().to_string(),
	})
}

fn absolute_path(cwd: &Path, raw: &str) -> PathBuf {
	let path = PathBuf::from(raw);
	let candidate = if path.is_absolute() {
		path
	}
	else {
		cwd.join(path)
	};
	pagefs::normalize_path(&candidate)
}

pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let resource = Resource::new(
		vec![
		opentelemetry::KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		opentelemetry::KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		opentelemetry::KeyValue::new("mcp.session_id", config.session_id.clone()),
		opentelemetry::KeyValue::new("mcp.root", config.default_root.display().to_string()),
		]
	);
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		let tracer = opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource))
			.install_batch(opentelemetry_sdk::runtime::Tokio)
			.ok();
		if let Some(tracer) = tracer {
			Some(OpenTelemetryLayer::new(tracer))
		}
		else {
			None
		}
	}
	else {
		None
	};
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_writer(std::io::stderr);
	let subscriber = tracing_subscriber::registry().with(fmt_layer);
	if let Some(layer) = tracing_layer {
		subscriber.with(layer).init();
	}
	else {
		subscriber.init();
	}
}

pub async fn run(config: Config) -> Result<()> {
	let stdin = io::stdin();
	let stdout = io::stdout();
	let mut reader = BufReader::new(stdin).lines();
	let mut writer = io::BufWriter::new(stdout);
	// the token store is owned here and handed to the dispatcher by
	// reference; handlers never reach for shared mutable state
	let ttl = config.token_ttl_secs.map(Duration::from_secs);
	let mut tokens = TokenStore::new(config.token_capacity, ttl);
	while let Some(line) = reader.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let req: Request = match serde_json::from_str(&line) {
			Ok(req) => req,
			Err(err) => {
				let resp = Response::err(Value::Null, -32700, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		let resp = handle_request(&config, &mut tokens, req).await;
		write_response(&mut writer, resp).await?;
	}
	Ok(())
}

async fn handle_request(config: &Config, tokens: &mut TokenStore, req: Request) -> Response {
	let method = req.method.clone();
	let tool_name = extract_tool_name(&method, &req.params);
	let span = info_span!(
		"mcp.request",
		"mcp.session_id" = %config.session_id,
		"mcp.method" = %method,
		"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
		"mcp.root" = %config.default_root.display(),
		"mcp.is_error" = tracing::field::Empty,
		"mcp.error_code" = tracing::field::Empty,
		"mcp.count" = tracing::field::Empty,
		"mcp.has_more" = tracing::field::Empty,
		"mcp.payload_bytes" = tracing::field::Empty,
		"mcp.response_bytes" = tracing::field::Empty,
	);
	let _guard = span.enter();
	match route(config, tokens, &req).await {
		Ok(value) => {
			record_result(&span, &value);
			Response::ok(req.id, value)
		}
		Err(err) => {
			if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
				Response::err(req.id, protocol.code, protocol.message.clone())
			}
			else {
				Response::err(req.id, -32000, err.to_string())
			}
		}
	}
}

async fn route(config: &Config, tokens: &mut TokenStore, req: &Request) -> Result<Value> {
	match req.method.as_str() {
		"initialize" => Ok(json!({
			"serverInfo": {
				"name": "mcp-pagefs",
				"version": env!("CARGO_PKG_VERSION")
			},
			"capabilities": {
				"tools": {
					"list": true,
					"call": true
				}
			}
		})),
		"tools/list" => Ok(json!({
			"tools": tool_definitions(),
		})),
		"tools/call" => {
			let name = req.params
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| ProtocolError::new(-32602, "name is required"))?;
			let arguments = req.params
				.get("arguments")
				.cloned()
				.unwrap_or_else(|| json!({}));
			execute_tool(
				config,
				tokens,
				name,
				&arguments
			).await
		}
		_ => Err(ProtocolError::new(-32601, "method not found").into()),
	}
}

async fn execute_tool(
	config: &Config,
	tokens: &mut TokenStore,
	name: &str,
	arguments: &Value) -> Result<Value> {
	let params = arguments.as_object().ok_or_else(|| ProtocolError::new(-32602, "arguments must be an object"))?;
	let args = Value::Object(params.clone());
	let result = match name {
		"list_roots" => list_roots_tool(config),
		"read_file" => read_file_tool(config, tokens, &args).await,
		"list_directory" => list_directory_tool(config, tokens, &args).await,
		"search_files" => search_files_tool(config, tokens, &args).await,
		"write_file" => write_file_tool(config, &args).await,
		"move_file" => move_file_tool(config, &args).await,
		"delete_file" => delete_file_tool(config, &args).await,
		_ => return Err(ProtocolError::new(-32601, "unknown tool").into()),
	};
	Ok(match result {
		Ok(structured) => tool_success(name, structured),
		Err(err) => tool_error(&err),
	})
}

fn list_roots_tool(config: &Config) -> Result<Value> {
	let roots: Vec<Value> = config.roots
		.iter()
		.map(|root| {
			json!({
				"path": root.display,
				"default": root.default
			})
		})
		.collect();
	Ok(chunk::build_envelope(
		json!({
			"roots": roots,
			"count": config.roots.len()
		}),
		false,
		None
	))
}

async fn read_file_tool(config: &Config, tokens: &mut TokenStore, args: &Value) -> Result<Value> {
	let token_id = args.get("continuation_token")
		.and_then(Value::as_str)
		.map(str::to_string);
	let stored = match &token_id {
		Some(id) => Some(tokens.get(id)?),
		None => None,
	};
	let path = args.get("path")
		.and_then(Value::as_str)
		.map(str::to_string)
		.or_else(|| stored_string(stored.as_ref(), "path"))
		.ok_or_else(|| anyhow!("path is required"))?;
	let resolved = resolve_for(config, &path)
		.map_err(|err| anyhow!("invalid path {}: {}", path, err))?;
	let target = resolved.to_string_lossy().to_string();
	let start_index = match &token_id {
		Some(id) => {
			let cursor = tokens.resume(id, OperationKind::ReadFile, &target)?;
			let Cursor::Line { next_line } = cursor else {
				return Err(EngineError::usage("cursor shape does not match operation kind").into());
			};
			next_line
		}
		None => {
			let start_line = args.get("start_line")
				.and_then(Value::as_u64)
				.unwrap_or(1)
				.max(1) as usize;
			start_line - 1
		}
	};
	let rel_path = display_path(config, &resolved);
	let content = tokio::fs::read_to_string(&resolved).await.map_err(|err| format_io_error("read", &rel_path, err.into()))?;
	let max_line = config.read_max_line_bytes.unwrap_or(usize::MAX);
	let mut source = pagefs::LineSource::new(&content, start_index, max_line);
	let total = source.total();
	let mut monitor = monitor_for(config);
	let chunk = chunk::assemble(&mut source, &mut monitor).await?;
	Span::current().record("mcp.payload_bytes", monitor.used_bytes() as u64);
	let long_lines = source.long_lines();
	let token = refresh_token(
		tokens,
		chunk.has_more,
		token_id,
		OperationKind::ReadFile,
		&target,
		chunk.next_cursor,
		json!({"path": path})
	)?;
	let count = chunk.items.len();
	let content_out = chunk.items
		.iter()
		.filter_map(Value::as_str)
		.collect::<Vec<_>>()
		.join("\n");
	let mut obj = serde_json::Map::new();
	obj.insert("path".to_string(), Value::String(rel_path));
	obj.insert("content".to_string(), Value::String(content_out));
	obj.insert("count".to_string(), Value::Number(count.into()));
	obj.insert("total".to_string(), Value::Number(total.into()));
	obj.insert("start_line".to_string(), Value::Number((start_index + 1).into()));
	if count == 0 && start_index >= total && total > 0 {
		obj.insert("code".to_string(), Value::String("EMPTY_RANGE".to_string()));
	}
	if long_lines {
		obj.insert("code".to_string(), Value::String("TRUNCATED_LONG_LINES".to_string()));
	}
	Ok(chunk::build_envelope(Value::Object(obj), chunk.has_more, token.as_deref()))
}

async fn list_directory_tool(config: &Config, tokens: &mut TokenStore, args: &Value) -> Result<Value> {
	let token_id = args.get("continuation_token")
		.and_then(Value::as_str)
		.map(str::to_string);
	let stored = match &token_id {
		Some(id) => Some(tokens.get(id)?),
		None => None,
	};
	let path = args.get("path")
		.and_then(Value::as_str)
		.map(str::to_string)
		.or_else(|| stored_string(stored.as_ref(), "path"))
		.unwrap_or_else(|| ".".to_string());
	let resolved = resolve_for(config, &path)
		.map_err(|err| anyhow!("invalid path {}: {}", path, err))?;
	let target = resolved.to_string_lossy().to_string();
	let next_index = match &token_id {
		Some(id) => {
			let cursor = tokens.resume(id, OperationKind::ListDirectory, &target)?;
			let Cursor::Entry { next_index } = cursor else {
				return Err(EngineError::usage("cursor shape does not match operation kind").into());
			};
			next_index
		}
		None => 0,
	};
	let rel_path = display_path(config, &resolved);
	let mut source = pagefs::DirSource::load(&resolved, next_index).await
		.map_err(|err| format_io_error("list", &rel_path, err))?;
	let total = source.total();
	let mut monitor = monitor_for(config);
	let chunk = chunk::assemble(&mut source, &mut monitor).await?;
	Span::current().record("mcp.payload_bytes", monitor.used_bytes() as u64);
	let token = refresh_token(
		tokens,
		chunk.has_more,
		token_id,
		OperationKind::ListDirectory,
		&target,
		chunk.next_cursor,
		json!({"path": path})
	)?;
	let count = chunk.items.len();
	Ok(chunk::build_envelope(
		json!({
			"path": rel_path,
			"entries": chunk.items,
			"count": count,
			"total": total
		}),
		chunk.has_more,
		token.as_deref()
	))
}

async fn search_files_tool(config: &Config, tokens: &mut TokenStore, args: &Value) -> Result<Value> {
	let token_id = args.get("continuation_token")
		.and_then(Value::as_str)
		.map(str::to_string);
	let stored = match &token_id {
		Some(id) => Some(tokens.get(id)?),
		None => None,
	};
	let pattern = args.get("pattern")
		.and_then(Value::as_str)
		.map(str::to_string)
		.or_else(|| stored_string(stored.as_ref(), "pattern"))
		.ok_or_else(|| anyhow!("pattern is required"))?;
	let root_param = args.get("root")
		.and_then(Value::as_str)
		.map(str::to_string)
		.or_else(|| stored_string(stored.as_ref(), "root"))
		.unwrap_or_else(|| ".".to_string());
	let glob: Vec<String> = args.get("glob")
		.or_else(|| stored.as_ref().and_then(|token| token.parameters.get("glob")))
		.and_then(Value::as_array)
		.map(
			|values| {
				values.iter()
					.filter_map(Value::as_str)
					.map(|value| value.to_string())
					.collect()
			})
		.unwrap_or_default();
	let case_value = args.get("case_sensitive")
		.cloned()
		.or_else(|| stored.as_ref().and_then(|token| token.parameters.get("case_sensitive").cloned()));
	let case = parse_case_sensitivity(case_value.as_ref())?;
	let resolved_root = resolve_for(config, &root_param)
		.map_err(|err| anyhow!("invalid path {}: {}", root_param, err))?;
	if !resolved_root.exists() {
		return Err(anyhow!("root not found: {}", root_param));
	}
	let target = resolved_root.to_string_lossy().to_string();
	let files_examined = match &token_id {
		Some(id) => {
			let cursor = tokens.resume(id, OperationKind::SearchFiles, &target)?;
			let Cursor::Scan { files_examined, .. } = cursor else {
				return Err(EngineError::usage("cursor shape does not match operation kind").into());
			};
			files_examined
		}
		None => 0,
	};
	let regex = pagefs::build_pattern(&pattern, case)?;
	let include = pagefs::build_include_set(&glob)?;
	let max_line = config.read_max_line_bytes.unwrap_or(usize::MAX);
	let mut source = pagefs::ScanSource::new(
		&resolved_root,
		regex,
		pagefs::ScanOptions {
			include,
			max_line_bytes: max_line
		},
		files_examined
	)?;
	let total_files = source.total_files();
	let mut monitor = monitor_for(config);
	let chunk = chunk::assemble(&mut source, &mut monitor).await?;
	Span::current().record("mcp.payload_bytes", monitor.used_bytes() as u64);
	let token = refresh_token(
		tokens,
		chunk.has_more,
		token_id,
		OperationKind::SearchFiles,
		&target,
		chunk.next_cursor,
		json!({
			"pattern": pattern.clone(),
			"root": root_param.clone(),
			"glob": glob,
			"case_sensitive": case_value.unwrap_or(Value::Null)
		})
	)?;
	let count = chunk.items.len();
	Ok(chunk::build_envelope(
		json!({
			"files": chunk.items,
			"pattern": pattern,
			"root": root_param,
			"count": count,
			"total_files": total_files
		}),
		chunk.has_more,
		token.as_deref()
	))
}

async fn write_file_tool(config: &Config, args: &Value) -> Result<Value> {
	let path = args.get("path")
		.and_then(Value::as_str)
		.ok_or_else(|| anyhow!("path is required"))?;
	let content = args.get("content")
		.and_then(Value::as_str)
		.ok_or_else(|| anyhow!("content is required"))?;
	let encoding = args.get("encoding")
		.and_then(Value::as_str)
		.unwrap_or("utf-8");
	let bytes = match encoding {
		"utf-8" | "utf8" => content.as_bytes().to_vec(),
		"base64" => base64::engine::general_purpose::STANDARD
			.decode(content)
			.map_err(|err| anyhow!("invalid base64 content: {}", err))?,
		_ => return Err(anyhow!("encoding must be utf-8 or base64")),
	};
	let mode = match args.get("mode")
		.and_then(Value::as_str)
		.unwrap_or("overwrite") {
		"overwrite" => WriteMode::Overwrite,
		"append" => WriteMode::Append,
		_ => return Err(anyhow!("mode must be overwrite or append")),
	};
	let chunk_size = match args.get("chunk_size").and_then(Value::as_u64) {
		Some(0) | None => config.write_chunk_size,
		Some(value) => value as usize,
	};
	let backup = args.get("backup")
		.and_then(Value::as_bool)
		.unwrap_or(config.write_backup);
	let retry_attempts = args.get("retry_attempts")
		.and_then(Value::as_u64)
		.map(|value| value as u32)
		.unwrap_or(config.write_retry_attempts);
	let verify = args.get("verify")
		.and_then(Value::as_bool)
		.unwrap_or(true);
	let resolved = resolve_for(config, path)
		.map_err(|err| anyhow!("invalid path {}: {}", path, err))?;
	let rel_path = display_path(config, &resolved);
	let report = write::execute(WriteRequest {
		path: resolved,
		content: bytes,
		mode,
		chunk_size,
		backup,
		retry_attempts,
		verify,
	}).await?;
	let backup_out = report.backup_path
		.as_ref()
		.map(|p| Value::String(display_path(config, p)))
		.unwrap_or(Value::Null);
	Ok(chunk::build_envelope(
		json!({
			"path": rel_path,
			"final_size": report.final_size,
			"chunks_written": report.chunks_written,
			"retries_used": report.retries_used,
			"elapsed_ms": report.elapsed_ms,
			"backup_path": backup_out
		}),
		false,
		None
	))
}

async fn move_file_tool(config: &Config, args: &Value) -> Result<Value> {
	let from = args.get("from")
		.and_then(Value::as_str)
		.ok_or_else(|| anyhow!("from is required"))?;
	let to = args.get("to")
		.and_then(Value::as_str)
		.ok_or_else(|| anyhow!("to is required"))?;
	let resolved_from = resolve_for(config, from)
		.map_err(|err| anyhow!("invalid path {}: {}", from, err))?;
	let resolved_to = resolve_for(config, to)
		.map_err(|err| anyhow!("invalid path {}: {}", to, err))?;
	if config.roots.iter().any(|root| resolved_from == root.path_canon || resolved_to == root.path_canon) {
		return Err(anyhow!("cannot move root"));
	}
	let rel_from = display_path(config, &resolved_from);
	let rel_to = display_path(config, &resolved_to);
	pagefs::move_path(&resolved_from, &resolved_to).await.map_err(|err| format_io_error("move", &rel_from, err))?;
	Ok(chunk::build_envelope(
		json!({
			"from": rel_from,
			"to": rel_to
		}),
		false,
		None
	))
}

async fn delete_file_tool(config: &Config, args: &Value) -> Result<Value> {
	let path = args.get("path")
		.and_then(Value::as_str)
		.ok_or_else(|| anyhow!("path is required"))?;
	let resolved = resolve_for(config, path)
		.map_err(|err| anyhow!("invalid path {}: {}", path, err))?;
	if config.roots.iter().any(|root| resolved == root.path_canon) {
		return Err(anyhow!("cannot delete root"));
	}
	let rel_path = display_path(config, &resolved);
	pagefs::delete_path(&resolved).await.map_err(|err| format_io_error("delete", &rel_path, err))?;
	Ok(chunk::build_envelope(
		json!({
			"path": rel_path
		}),
		false,
		None
	))
}

fn stored_string(token: Option<&ContinuationToken>, key: &str) -> Option<String> {
	token.and_then(|token| {
		token.parameters
			.get(key)
			.and_then(Value::as_str)
			.map(str::to_string)
	})
}

fn resolve_for(config: &Config, rel: &str) -> Result<PathBuf> {
	pagefs::resolve_path(
		&config.default_root,
		&config.default_root_canon,
		rel,
		config.allow_escape,
		&config.allowed_roots
	)
}

fn display_path(config: &Config, path: &Path) -> String {
	for root in &config.roots {
		if path.starts_with(&root.path_canon) {
			return pagefs::relative_to_root(&root.path_canon, path);
		}
	}
	path.to_string_lossy().to_string()
}

fn monitor_for(config: &Config) -> SizeBudgetMonitor {
	match config.response_max_bytes {
		Some(limit) => SizeBudgetMonitor::new(limit),
		None => SizeBudgetMonitor::unbounded(),
	}
}

/// Keeps the caller's handle stable: the same token id survives across a
/// pagination run and disappears once the operation completes.
fn refresh_token(
	tokens: &mut TokenStore,
	has_more: bool,
	existing: Option<String>,
	kind: OperationKind,
	target: &str,
	cursor: Cursor,
	parameters: Value) -> Result<Option<String>> {
	if has_more {
		match existing {
			Some(id) => {
				tokens.update(&id, cursor)?;
				Ok(Some(id))
			}
			None => Ok(Some(tokens.generate(kind, target, cursor, parameters)?)),
		}
	}
	else {
		if let Some(id) = existing {
			tokens.remove(&id);
		}
		Ok(None)
	}
}

fn parse_case_sensitivity(value: Option<&Value>) -> Result<pagefs::CaseSensitivity> {
	let Some(value) = value else {
		return Ok(pagefs::CaseSensitivity::Auto);
	};
	if value.is_null() {
		return Ok(pagefs::CaseSensitivity::Auto);
	}
	if let Some(boolean) = value.as_bool() {
		return Ok(if boolean {
			pagefs::CaseSensitivity::Sensitive
		}
		else {
			pagefs::CaseSensitivity::Insensitive
		});
	}
	let text = value.as_str().ok_or_else(|| anyhow!("case_sensitive must be bool or string"))?;
	match text.to_lowercase().as_str() {
		"auto" => Ok(pagefs::CaseSensitivity::Auto),
		"true" | "sensitive" => Ok(pagefs::CaseSensitivity::Sensitive),
		"false" | "insensitive" => Ok(pagefs::CaseSensitivity::Insensitive),
		_ => Err(anyhow!("case_sensitive must be auto|true|false")),
	}
}

fn tool_success(name: &str, structured: Value) -> Value {
	let message = tool_message(name, &structured);
	json!({
		"structuredContent": structured,
		"content": [
			{
				"type": "text",
				"text": message
			}
		]
	})
}

fn tool_error(err: &anyhow::Error) -> Value {
	let message = err.to_string();
	let code = match err.downcast_ref::<EngineError>() {
		Some(engine) => engine.code(),
		None => error_code(&message),
	};
	json!({
		"isError": true,
		"structuredContent": {
			"code": code
		},
		"content": [
			{
				"type": "text",
				"text": message
			}
		]
	})
}

fn tool_message(name: &str, structured: &Value) -> String {
	let has_more = structured.get("has_more")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	let more_suffix = if has_more {
		" More remain; resume with the continuation token."
	}
	else {
		""
	};
	match name {
		"list_roots" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			format!("Listed {} root(s).", count)
		}
		"read_file" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			let total = get_u64(structured, "total").unwrap_or(count);
			let start_line = get_u64(structured, "start_line").unwrap_or(1);
			let path = structured.get("path")
				.and_then(Value::as_str)
				.unwrap_or("file");
			if structured.get("code")
				.and_then(Value::as_str)
				.map(|code| code == "EMPTY_RANGE")
				.unwrap_or(false) {
				return format!(
					"No lines returned from {}: start_line {} exceeds total {}.",
					path, start_line, total
				);
			}
			format!(
				"Read {} line(s) from {} (start line {}, total {}).{}",
				count, path, start_line, total, more_suffix
			)
		}
		"list_directory" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			let total = get_u64(structured, "total").unwrap_or(count);
			let path = structured.get("path")
				.and_then(Value::as_str)
				.unwrap_or("directory");
			format!(
				"Listed {} of {} entries in {}.{}",
				count, total, path, more_suffix
			)
		}
		"search_files" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			format!("Returned matches for {} file(s).{}", count, more_suffix)
		}
		"write_file" => {
			let path = structured.get("path")
				.and_then(Value::as_str)
				.unwrap_or("file");
			let size = get_u64(structured, "final_size").unwrap_or(0);
			let chunks = get_u64(structured, "chunks_written").unwrap_or(0);
			let retries = get_u64(structured, "retries_used").unwrap_or(0);
			if retries > 0 {
				format!(
					"Wrote {} bytes to {} in {} chunk(s) after {} retry(ies).",
					size, path, chunks, retries
				)
			}
			else {
				format!("Wrote {} bytes to {} in {} chunk(s).", size, path, chunks)
			}
		}
		"move_file" => {
			let from = structured.get("from")
				.and_then(Value::as_str)
				.unwrap_or("source");
			let to = structured.get("to")
				.and_then(Value::as_str)
				.unwrap_or("destination");
			format!("Moved {} to {}.", from, to)
		}
		"delete_file" => {
			let path = structured.get("path")
				.and_then(Value::as_str)
				.unwrap_or("file");
			format!("Deleted {}.", path)
		}
		_ => "Completed tool call.".to_string(),
	}
}

fn get_u64(value: &Value, key: &str) -> Option<u64> {
	value.get(key).and_then(Value::as_u64)
}

fn error_code(message: &str) -> &'static str {
	let lower = message.to_lowercase();
	if lower.contains("path is required") {
		"MISSING_PATH"
	}
	else if lower.contains("pattern is required") {
		"MISSING_PATTERN"
	}
	else if lower.contains("content is required") {
		"MISSING_CONTENT"
	}
	else if lower.contains("from is required") {
		"MISSING_FROM"
	}
	else if lower.contains("to is required") {
		"MISSING_TO"
	}
	else if lower.contains("path outside root") {
		"PATH_OUTSIDE_ROOT"
	}
	else if lower.contains("invalid path") {
		"INVALID_PATH"
	}
	else if lower.contains("target exists") {
		"TARGET_EXISTS"
	}
	else if lower.contains("cannot delete root") {
		"DELETE_ROOT_DENIED"
	}
	else if lower.contains("cannot move root") {
		"MOVE_ROOT_DENIED"
	}
	else if lower.contains("mode must be") {
		"INVALID_MODE"
	}
	else if lower.contains("encoding must be") || lower.contains("invalid base64") {
		"INVALID_ENCODING"
	}
	else if lower.contains("invalid pattern") {
		"INVALID_PATTERN"
	}
	else if lower.contains("invalid glob") {
		"INVALID_GLOB"
	}
	else if lower.contains("root not found") {
		"ROOT_NOT_FOUND"
	}
	else if lower.contains("no such file") || lower.contains("not found") {
		"FILE_NOT_FOUND"
	}
	else if lower.contains("permission denied") {
		"PERMISSION_DENIED"
	}
	else {
		"EXECUTION_ERROR"
	}
}

fn format_io_error(action: &str, path: &str, err: anyhow::Error) -> anyhow::Error {
	if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
		let reason = match io_err.kind() {
			std::io::ErrorKind::NotFound => "not found",
			std::io::ErrorKind::PermissionDenied => "permission denied",
			std::io::ErrorKind::InvalidInput => "invalid input",
			std::io::ErrorKind::InvalidData => "not valid utf-8",
			_ => "io error",
		};
		return anyhow!("{} {}: {}", action, path, reason);
	}
	anyhow!("{} {}: {}", action, path, err)
}

fn tool_definitions() -> Vec<Value> {
	vec![json!({
		"name": "read_file",
		"description": "Read a file as numbered lines. Responses are size-budgeted; when has_more is true, call again with the continuation_token to get the next slice.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": {
					"type": "string",
					"description": "File path, relative to the default root or absolute."
				},
				"start_line": {
					"type": "integer",
					"minimum": 1,
					"description": "First line to return (1-based). Ignored when resuming."
				},
				"continuation_token": {
					"type": "string",
					"description": "Token from a previous truncated read of the same file."
				}
			},
			"required": ["path"]
		}
	}),
	json!({
		"name": "list_directory",
		"description": "List one directory level, sorted by name. Responses are size-budgeted; resume with the continuation_token while has_more is true.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": {
					"type": "string",
					"description": "Directory path. Defaults to the root."
				},
				"continuation_token": {
					"type": "string",
					"description": "Token from a previous truncated listing of the same directory."
				}
			}
		}
	}),
	json!({
		"name": "search_files",
		"description": "Search file contents with a regex under a root. Matches are grouped per file; resume with the continuation_token while has_more is true.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"pattern": {
					"type": "string",
					"description": "Regular expression to match against each line."
				},
				"root": {
					"type": "string",
					"description": "Directory to search. Defaults to the root."
				},
				"glob": {
					"type": "array",
					"items": { "type": "string" },
					"description": "Only search files whose relative path matches one of these globs."
				},
				"case_sensitive": {
					"type": ["boolean", "string"],
					"description": "true, false, or auto (case-insensitive unless the pattern has uppercase)."
				},
				"continuation_token": {
					"type": "string",
					"description": "Token from a previous truncated search of the same root."
				}
			},
			"required": ["pattern"]
		}
	}),
	json!({
		"name": "write_file",
		"description": "Write a file of any size: free-space preflight, optional backup of an existing target, streamed chunked write, durability sync, atomic rename commit, size verification, bounded retry with rollback.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": {
					"type": "string",
					"description": "Target path, relative to the default root or absolute."
				},
				"content": {
					"type": "string",
					"description": "Content to persist."
				},
				"encoding": {
					"type": "string",
					"enum": ["utf-8", "base64"],
					"description": "How content is encoded. Defaults to utf-8."
				},
				"mode": {
					"type": "string",
					"enum": ["overwrite", "append"],
					"description": "overwrite commits via atomic rename; append writes in place."
				},
				"chunk_size": {
					"type": "integer",
					"minimum": 1,
					"description": "Bytes per streamed chunk. Defaults to the server setting."
				},
				"backup": {
					"type": "boolean",
					"description": "Back up an existing target before mutating it."
				},
				"retry_attempts": {
					"type": "integer",
					"minimum": 0,
					"description": "Retries after the first failed attempt, with exponential backoff."
				},
				"verify": {
					"type": "boolean",
					"description": "Verify the final size after commit. Defaults to true."
				}
			},
			"required": ["path", "content"]
		}
	}),
	json!({
		"name": "move_file",
		"description": "Move or rename a file or directory. Falls back to copy+delete across devices.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"from": { "type": "string" },
				"to": { "type": "string" }
			},
			"required": ["from", "to"]
		}
	}),
	json!({
		"name": "delete_file",
		"description": "Delete a file or directory (recursively).",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string" }
			},
			"required": ["path"]
		}
	}),
	json!({
		"name": "list_roots",
		"description": "List the configured roots.",
		"inputSchema": {
			"type": "object",
			"properties": {}
		}
	})]
}

fn extract_tool_name(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" {
		return None;
	}
	params.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn record_result(span: &Span, result: &Value) {
	let response_bytes = serde_json::to_string(result).map(|value| value.as_bytes().len() as u64).ok();
	if let Some(bytes) = response_bytes {
		span.record("mcp.response_bytes", bytes);
	}
	let is_error = result.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("mcp.is_error", is_error);
	if let Some(code) = result.get("structuredContent")
		.and_then(|value| value.get("code"))
		.and_then(Value::as_str) {
		span.record("mcp.error_code", code);
	}
	if let Some(count) = result.get("structuredContent")
		.and_then(|value| value.get("count"))
		.and_then(Value::as_u64) {
		span.record("mcp.count", count);
	}
	if let Some(has_more) = result.get("structuredContent")
		.and_then(|value| value.get("has_more"))
		.and_then(Value::as_bool) {
		span.record("mcp.has_more", has_more);
	}
}

fn parse_usize(value: &str, label: &str) -> Result<usize> {
	value.trim().parse::<usize>().map_err(|_| anyhow!("{} must be a non-negative integer", label))
}

fn parse_byte_limit(value: &str, label: &str) -> Result<Option<usize>> {
	let parsed = parse_usize(value, label)?;
	if parsed == 0 {
		return Ok(None);
	}
	Ok(Some(parsed))
}

fn parse_bool(value: &str, label: &str) -> Result<bool> {
	let value = value.trim().to_lowercase();
	match value.as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", label)),
	}
}

async fn write_response(writer: &mut io::BufWriter<io::Stdout>, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}
