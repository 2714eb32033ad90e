use std::io::{self, IsTerminal};

use color_eyre::Result;
use coproof_core::{CommandStatus, ExecutionOutcome};
use serde_json::{json, Value};

use crate::dispatch::CommandInfo;
use crate::style::Style;

#[derive(Clone, Copy, Debug)]
pub struct OutputOptions {
    pub quiet: bool,
    pub json: bool,
    pub no_color: bool,
}

pub fn emit_output(opts: &OutputOptions, info: CommandInfo, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.status.exit_code();
    let style = Style::new(opts.no_color, io::stdout().is_terminal());

    if opts.json {
        let payload = to_json_response(info, outcome);
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(code);
    }

    if outcome.status == CommandStatus::Ok {
        if opts.quiet {
            return Ok(code);
        }
        if is_passthrough(&outcome.details) {
            print!("{}", outcome.message);
            if !outcome.message.ends_with('\n') {
                println!();
            }
        } else {
            let message = format_status_message(info, &outcome.message);
            println!("{}", style.status(outcome.status, &message));
            if let Some(table) = render_statement_table(&style, info, &outcome.details) {
                println!("{table}");
            }
        }
        if let Some(hint) = hint_from_details(&outcome.details) {
            println!("{}", style.info(&format!("Tip: {hint}")));
        }
        return Ok(code);
    }

    let header = match error_code(&outcome.details) {
        Some(code) => format!("{code}  {}", outcome.message),
        None => outcome.message.clone(),
    };
    eprintln!("{}", style.error_header(&header));
    let reasons = collect_why_bullets(&outcome.details);
    if !reasons.is_empty() {
        eprintln!();
        eprintln!("Why:");
        for reason in reasons {
            eprintln!("  • {reason}");
        }
    }
    if let Some(hint) = hint_from_details(&outcome.details) {
        eprintln!();
        eprintln!("Fix:");
        eprintln!("{}", style.info(&format!("  • {hint}")));
    }

    Ok(code)
}

pub fn to_json_response(info: CommandInfo, outcome: &ExecutionOutcome) -> Value {
    let details = match &outcome.details {
        Value::Object(_) => outcome.details.clone(),
        Value::Null => json!({}),
        other => json!({ "value": other }),
    };
    json!({
        "status": outcome.status,
        "message": format_status_message(info, &outcome.message),
        "details": details,
    })
}

fn format_status_message(info: CommandInfo, message: &str) -> String {
    if message.contains('\n') {
        return message.to_string();
    }
    format!("coproof {}: {message}", info.name)
}

fn error_code(details: &Value) -> Option<&str> {
    details.get("code").and_then(Value::as_str)
}

fn hint_from_details(details: &Value) -> Option<&str> {
    details.get("hint").and_then(Value::as_str)
}

fn is_passthrough(details: &Value) -> bool {
    details
        .get("passthrough")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn collect_why_bullets(details: &Value) -> Vec<String> {
    let mut bullets = Vec::new();
    if let Some(files) = details.get("conflicting_files").and_then(Value::as_array) {
        for file in files.iter().filter_map(Value::as_str) {
            bullets.push(format!("conflict in {file}"));
        }
    }
    if let Some(missing) = details.get("missing").and_then(Value::as_array) {
        for entry in missing {
            let id = entry.get("statement_id").and_then(Value::as_str).unwrap_or("?");
            match entry.get("role").and_then(Value::as_str) {
                Some(role) => bullets.push(format!("{role} {id} is not indexed")),
                None => bullets.push(format!("{id} is missing")),
            }
        }
    }
    if let Some(cycle) = details.get("cycle_path").and_then(Value::as_str) {
        bullets.push(format!("cycle: {cycle}"));
    }
    if let Some(stderr) = details
        .get("stderr")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
    {
        bullets.push(stderr.to_string());
    }
    let diagnostics = details
        .pointer("/verification/report/diagnostics")
        .or_else(|| details.pointer("/report/diagnostics"))
        .and_then(Value::as_array);
    for diagnostic in diagnostics.into_iter().flatten() {
        let line = diagnostic.get("line").and_then(Value::as_u64).unwrap_or(0);
        let message = diagnostic.get("message").and_then(Value::as_str).unwrap_or("");
        bullets.push(format!("line {line}: {message}"));
    }
    bullets
}

fn render_statement_table(style: &Style, info: CommandInfo, details: &Value) -> Option<String> {
    if info.name != "graph" {
        return None;
    }
    let statements = details.get("statements")?.as_array()?;
    if statements.is_empty() {
        return None;
    }

    let mut rows = Vec::with_capacity(statements.len());
    for node in statements {
        let proven_by = node.get("proven_by").and_then(Value::as_str);
        rows.push([
            node.get("statement_id")?.as_str()?.to_string(),
            node.get("kind")?.as_str()?.to_string(),
            node.get("title")?.as_str()?.to_string(),
            match (node.get("is_resolved")?.as_bool()?, proven_by) {
                (true, Some(child)) => format!("closed by {}", child.get(..8).unwrap_or(child)),
                (true, None) => "proved".to_string(),
                (false, _) => "open".to_string(),
            },
        ]);
    }

    let headers = ["Statement", "Kind", "Title", "State"];
    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    let line = |cells: [&str; 4]| {
        format!(
            "{:<w0$}  {:<w1$}  {:<w2$}  {}",
            cells[0],
            cells[1],
            cells[2],
            cells[3],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
        )
    };

    let mut lines = vec![style.dimmed(&line(headers))];
    for row in &rows {
        lines.push(line([
            row[0].as_str(),
            row[1].as_str(),
            row[2].as_str(),
            row[3].as_str(),
        ]));
    }
    Some(lines.join("\n"))
}
