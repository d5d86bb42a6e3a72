use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

struct RpcClient {
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
	next_id: u64,
}

impl RpcClient {
	fn spawn(root: &Path) -> Self {
		Self::spawn_with_args(root, &[])
	}
	fn spawn_with_args(root: &Path, extra: &[&str]) -> Self {
		let bin = env!("CARGO_BIN_EXE_mcp-pagefs");
		let mut command = Command::new(bin);
		command.arg("--root")
			.arg(root)
			.arg("--otel-enabled")
			.arg("false");
		for arg in extra {
			command.arg(arg);
		}
		let mut child = command.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.spawn()
			.expect("spawn mcp-pagefs");
		let stdin = child.stdin
			.take()
			.expect("stdin");
		let stdout = child.stdout
			.take()
			.expect("stdout");
		Self {
			child,
			stdin,
			stdout: BufReader::new(stdout),
			next_id: 1
		}
	}
	fn send(&mut self, method: &str, params: Value) -> Value {
		let id = self.next_id;
		self.next_id += 1;
		let req = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params
		});
		let line = serde_json::to_string(&req).expect("serialize request");
		writeln!(self.stdin, "{}", line).expect("write request");
		self.stdin
			.flush()
			.expect("flush request");
		let mut resp_line = String::new();
		loop {
			resp_line.clear();
			let bytes = self.stdout
				.read_line(&mut resp_line)
				.expect("read response");
			if bytes == 0 {
				panic!("mcp-pagefs exited unexpectedly");
			}
			let trimmed = resp_line.trim();
			if trimmed.is_empty() {
				continue;
			}
			let parsed: Value = match serde_json::from_str(trimmed) {
				Ok(value) => value,
				Err(_) => continue,
			};
			if parsed.get("id").and_then(Value::as_u64) == Some(id) {
				return parsed;
			}
		}
	}
	fn call(&mut self, name: &str, arguments: Value) -> Value {
		let resp = self.send("tools/call", json!({
			"name": name,
			"arguments": arguments
		}));
		resp.get("result")
			.cloned()
			.expect("result")
	}
}

impl Drop for RpcClient {
	fn drop(&mut self) {
		let _ = self.child.kill();
	}
}

fn write_text(path: &Path, contents: &str) {
	std::fs::create_dir_all(path.parent().unwrap()).expect("create parent");
	std::fs::write(path, contents).expect("write file");
}

fn text_lines(count: usize) -> String {
	(1..=count).map(|n| format!("line {:04}", n)).collect::<Vec<_>>().join("\n")
}

fn structured(result: &Value) -> &Value {
	result.get("structuredContent").expect("structured")
}

fn token_of(result: &Value) -> String {
	structured(result)
		.get("continuation_token")
		.and_then(Value::as_str)
		.expect("continuation token")
		.to_string()
}

fn has_more(result: &Value) -> bool {
	structured(result)
		.get("has_more")
		.and_then(Value::as_bool)
		.expect("has_more")
}

fn error_code(result: &Value) -> &str {
	assert_eq!(result.get("isError").and_then(Value::as_bool), Some(true));
	structured(result)
		.get("code")
		.and_then(Value::as_str)
		.expect("code")
}

#[test]
fn read_file_fits_in_one_response() {
	let root = tempfile::tempdir().expect("tempdir");
	let file = root.path().join("sample.txt");
	write_text(&file, &text_lines(6));
	let mut client = RpcClient::spawn(root.path());
	let result = client.call("read_file", json!({ "path": "sample.txt" }));
	let structured = structured(&result);
	assert_eq!(structured.get("count").and_then(Value::as_u64), Some(6));
	assert_eq!(structured.get("total").and_then(Value::as_u64), Some(6));
	assert_eq!(structured.get("has_more"), Some(&Value::Bool(false)));
	assert!(structured.get("continuation_token").is_none());
	let content = structured.get("content")
		.and_then(Value::as_str)
		.expect("content");
	assert!(content.contains("1: line 0001"));
	assert!(content.contains("6: line 0006"));
}

#[test]
fn read_file_chunks_concatenate_without_loss() {
	let root = tempfile::tempdir().expect("tempdir");
	let file = root.path().join("big.txt");
	write_text(&file, &text_lines(120));
	let mut client = RpcClient::spawn_with_args(root.path(), &["--response-max-bytes", "600"]);
	let mut collected: Vec<String> = Vec::new();
	let mut result = client.call("read_file", json!({ "path": "big.txt" }));
	let mut calls = 1;
	loop {
		let structured = structured(&result);
		let content = structured.get("content")
			.and_then(Value::as_str)
			.expect("content");
		if !content.is_empty() {
			collected.extend(content.lines().map(|line| line.to_string()));
		}
		if !has_more(&result) {
			break;
		}
		let token = token_of(&result);
		result = client.call("read_file", json!({ "continuation_token": token }));
		calls += 1;
		assert!(calls < 50, "resumption did not converge");
	}
	assert!(calls > 1, "budget was expected to force chunking");
	let expected: Vec<String> = text_lines(120)
		.lines()
		.enumerate()
		.map(|(index, line)| format!("{}: {}", index + 1, line))
		.collect();
	assert_eq!(collected, expected);
}

#[test]
fn oversized_single_line_ships_alone() {
	let root = tempfile::tempdir().expect("tempdir");
	let file = root.path().join("wide.txt");
	let content = format!("{}\nshort tail", "x".repeat(5000));
	write_text(&file, &content);
	let mut client = RpcClient::spawn_with_args(root.path(), &["--response-max-bytes", "1000"]);
	let result = client.call("read_file", json!({ "path": "wide.txt" }));
	assert_eq!(
		structured(&result).get("count").and_then(Value::as_u64),
		Some(1)
	);
	assert!(has_more(&result));
	let token = token_of(&result);
	let result = client.call("read_file", json!({ "continuation_token": token }));
	assert_eq!(
		structured(&result).get("count").and_then(Value::as_u64),
		Some(1)
	);
	assert!(!has_more(&result));
}

#[test]
fn token_is_rejected_for_a_different_operation() {
	let root = tempfile::tempdir().expect("tempdir");
	let file = root.path().join("big.txt");
	write_text(&file, &text_lines(200));
	let mut client = RpcClient::spawn_with_args(root.path(), &["--response-max-bytes", "400"]);
	let result = client.call("read_file", json!({ "path": "big.txt" }));
	assert!(has_more(&result));
	let token = token_of(&result);
	let result = client.call("list_directory", json!({ "continuation_token": token }));
	assert_eq!(error_code(&result), "TOKEN_MISMATCH");
}

#[test]
fn token_is_rejected_for_a_different_target() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("big.txt"), &text_lines(200));
	write_text(&root.path().join("other.txt"), &text_lines(3));
	let mut client = RpcClient::spawn_with_args(root.path(), &["--response-max-bytes", "400"]);
	let result = client.call("read_file", json!({ "path": "big.txt" }));
	let token = token_of(&result);
	let result = client.call(
		"read_file",
		json!({ "path": "other.txt", "continuation_token": token })
	);
	assert_eq!(error_code(&result), "TOKEN_MISMATCH");
}

#[test]
fn unknown_token_is_reported_as_not_found() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("a.txt"), "one");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call(
		"read_file",
		json!({ "path": "a.txt", "continuation_token": "no-such-token" })
	);
	assert_eq!(error_code(&result), "TOKEN_NOT_FOUND");
}

#[test]
fn completed_read_consumes_the_token() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("big.txt"), &text_lines(80));
	let mut client = RpcClient::spawn_with_args(root.path(), &["--response-max-bytes", "700"]);
	let mut result = client.call("read_file", json!({ "path": "big.txt" }));
	let mut last_token = None;
	while has_more(&result) {
		let token = token_of(&result);
		last_token = Some(token.clone());
		result = client.call("read_file", json!({ "continuation_token": token }));
	}
	let token = last_token.expect("read was expected to chunk");
	let result = client.call("read_file", json!({ "continuation_token": token }));
	assert_eq!(error_code(&result), "TOKEN_NOT_FOUND");
}

#[test]
fn list_directory_resumes_to_full_coverage() {
	let root = tempfile::tempdir().expect("tempdir");
	for index in 0..60 {
		write_text(&root.path().join(format!("f{:03}.txt", index)), "x");
	}
	let mut client = RpcClient::spawn_with_args(root.path(), &["--response-max-bytes", "800"]);
	let mut names: Vec<String> = Vec::new();
	let mut result = client.call("list_directory", json!({ "path": "." }));
	let mut calls = 1;
	loop {
		let structured = structured(&result);
		assert_eq!(structured.get("total").and_then(Value::as_u64), Some(60));
		let entries = structured.get("entries")
			.and_then(Value::as_array)
			.expect("entries");
		for entry in entries {
			names.push(
				entry.get("name")
					.and_then(Value::as_str)
					.expect("name")
					.to_string()
			);
		}
		if !has_more(&result) {
			break;
		}
		let token = token_of(&result);
		result = client.call("list_directory", json!({ "continuation_token": token }));
		calls += 1;
		assert!(calls < 50, "resumption did not converge");
	}
	assert!(calls > 1, "budget was expected to force chunking");
	let expected: Vec<String> = (0..60).map(|index| format!("f{:03}.txt", index)).collect();
	assert_eq!(names, expected);
}

#[test]
fn search_files_resumes_across_files() {
	let root = tempfile::tempdir().expect("tempdir");
	for index in 0..8 {
		let body = (0..10)
			.map(|line| format!("needle number {} in file {}", line, index))
			.collect::<Vec<_>>()
			.join("\n");
		write_text(&root.path().join(format!("m{}.txt", index)), &body);
	}
	write_text(&root.path().join("plain.txt"), "nothing to see");
	let mut client = RpcClient::spawn_with_args(root.path(), &["--response-max-bytes", "900"]);
	let mut paths: Vec<String> = Vec::new();
	let mut result = client.call("search_files", json!({ "pattern": "needle" }));
	let mut calls = 1;
	loop {
		let structured = structured(&result);
		let files = structured.get("files")
			.and_then(Value::as_array)
			.expect("files");
		for file in files {
			paths.push(
				file.get("path")
					.and_then(Value::as_str)
					.expect("path")
					.to_string()
			);
			let matches = file.get("matches")
				.and_then(Value::as_array)
				.expect("matches");
			assert_eq!(matches.len(), 10);
		}
		if !has_more(&result) {
			break;
		}
		let token = token_of(&result);
		result = client.call("search_files", json!({ "continuation_token": token }));
		calls += 1;
		assert!(calls < 50, "resumption did not converge");
	}
	assert!(calls > 1, "budget was expected to force chunking");
	let expected: Vec<String> = (0..8).map(|index| format!("m{}.txt", index)).collect();
	assert_eq!(paths, expected);
}

#[test]
fn write_file_reports_exact_size_and_chunks() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	let content = "x".repeat(10_000);
	let result = client.call(
		"write_file",
		json!({ "path": "fresh.txt", "content": content, "chunk_size": 1024 })
	);
	let structured = structured(&result);
	assert_eq!(structured.get("final_size").and_then(Value::as_u64), Some(10_000));
	assert_eq!(structured.get("chunks_written").and_then(Value::as_u64), Some(10));
	assert_eq!(structured.get("retries_used").and_then(Value::as_u64), Some(0));
	assert_eq!(structured.get("backup_path"), Some(&Value::Null));
	assert_eq!(structured.get("has_more"), Some(&Value::Bool(false)));
	let written = std::fs::read_to_string(root.path().join("fresh.txt")).expect("read back");
	assert_eq!(written, content);
}

#[test]
fn write_file_appends_in_place() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("log.txt"), "abc");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call(
		"write_file",
		json!({ "path": "log.txt", "content": "def", "mode": "append", "backup": false })
	);
	let structured = structured(&result);
	assert_eq!(structured.get("final_size").and_then(Value::as_u64), Some(6));
	let written = std::fs::read_to_string(root.path().join("log.txt")).expect("read back");
	assert_eq!(written, "abcdef");
}

#[test]
fn write_file_decodes_base64_content() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call(
		"write_file",
		json!({ "path": "bin.dat", "content": "AAEC/w==", "encoding": "base64" })
	);
	let structured = structured(&result);
	assert_eq!(structured.get("final_size").and_then(Value::as_u64), Some(4));
	let written = std::fs::read(root.path().join("bin.dat")).expect("read back");
	assert_eq!(written, vec![0u8, 1, 2, 255]);
}

#[test]
fn write_file_backs_up_the_previous_content() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("data.txt"), "before");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call(
		"write_file",
		json!({ "path": "data.txt", "content": "after" })
	);
	let structured = structured(&result);
	let backup = structured.get("backup_path")
		.and_then(Value::as_str)
		.expect("backup path");
	assert!(backup.contains(".backup."));
	let saved = std::fs::read_to_string(root.path().join(backup)).expect("read backup");
	assert_eq!(saved, "before");
	let written = std::fs::read_to_string(root.path().join("data.txt")).expect("read target");
	assert_eq!(written, "after");
}

#[test]
fn write_file_rejects_unknown_encoding() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call(
		"write_file",
		json!({ "path": "x.txt", "content": "data", "encoding": "latin-1" })
	);
	assert_eq!(error_code(&result), "INVALID_ENCODING");
}

#[test]
fn paths_outside_the_root_are_denied() {
	let base = tempfile::tempdir().expect("tempdir");
	let root_dir = base.path().join("root");
	std::fs::create_dir_all(&root_dir).expect("root dir");
	write_text(&base.path().join("external.txt"), "outside");
	let mut client = RpcClient::spawn(&root_dir);
	let result = client.call("read_file", json!({ "path": "../external.txt" }));
	assert_eq!(error_code(&result), "PATH_OUTSIDE_ROOT");
}

#[test]
fn move_and_delete_round_trip() {
	let root = tempfile::tempdir().expect("tempdir");
	let nested = root.path().join("src").join("nested");
	std::fs::create_dir_all(&nested).expect("nested dir");
	write_text(&nested.join("file.txt"), "data");
	let mut client = RpcClient::spawn(root.path());
	let _ = client.call("move_file", json!({ "from": "src", "to": "dst" }));
	assert!(root.path().join("dst/nested/file.txt").exists());
	let _ = client.call("delete_file", json!({ "path": "dst" }));
	assert!(!root.path().join("dst").exists());
}

#[test]
fn move_file_refuses_existing_target() {
	let root = tempfile::tempdir().expect("tempdir");
	write_text(&root.path().join("from.txt"), "from");
	write_text(&root.path().join("to.txt"), "to");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call("move_file", json!({ "from": "from.txt", "to": "to.txt" }));
	assert_eq!(error_code(&result), "TARGET_EXISTS");
}

#[test]
fn list_roots_marks_the_default() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	let result = client.call("list_roots", json!({}));
	let structured = structured(&result);
	let roots = structured.get("roots")
		.and_then(Value::as_array)
		.expect("roots");
	assert_eq!(roots.len(), 1);
	assert_eq!(roots[0].get("default").and_then(Value::as_bool), Some(true));
}

#[test]
fn tools_list_names_every_tool() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	let resp = client.send("tools/list", json!({}));
	let tools = resp.get("result")
		.and_then(|result| result.get("tools"))
		.and_then(Value::as_array)
		.expect("tools");
	let names: Vec<&str> = tools.iter()
		.filter_map(|tool| tool.get("name").and_then(Value::as_str))
		.collect();
	for expected in [
		"read_file",
		"list_directory",
		"search_files",
		"write_file",
		"move_file",
		"delete_file",
		"list_roots",
	] {
		assert!(names.contains(&expected), "missing tool {}", expected);
	}
}

#[test]
fn unknown_tool_is_a_protocol_error() {
	let root = tempfile::tempdir().expect("tempdir");
	let mut client = RpcClient::spawn(root.path());
	let resp = client.send("tools/call", json!({
		"name": "no_such_tool",
		"arguments": {}
	}));
	let error = resp.get("error").expect("error");
	assert_eq!(error.get("code").and_then(Value::as_i64), Some(-32601));
}
