//! HTML directory index pages.

use chrono::{DateTime, Local};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Everything except RFC 3986 unreserved characters gets escaped in hrefs.
const HREF_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Directory children, directories first, each group sorted by name.
///
/// Entries whose metadata cannot be read (dangling symlinks, races with
/// deletion) are left out.
pub fn collect_entries(dir: &Path) -> io::Result<Vec<ListingEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        // Follow symlinks so a linked directory lists as a directory.
        let Ok(meta) = fs::metadata(entry.path()) else {
            continue;
        };
        entries.push(ListingEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: meta.len(),
            modified: meta.modified().ok(),
        });
    }

    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
    Ok(entries)
}

/// Render the index page for `dir`, served at (decoded) `request_path`.
pub fn render(dir: &Path, request_path: &str) -> io::Result<String> {
    let entries = collect_entries(dir)?;
    let title = escape_html(request_path);

    let mut html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Index of {title}</title>
    <style>
        body {{ font-family: 'Segoe UI', sans-serif; background-color: #f8f9fa; color: #343a40; padding: 2rem 3rem; }}
        h1 {{ color: #007bff; font-size: 2.5rem; line-height: 1.2; margin-bottom: 2rem; }}
        table {{ width: 100%; border-collapse: collapse; font-size: 1rem; }}
        th, td {{ text-align: left; padding: 0.75rem 1rem; }}
        th {{ background-color: #e9f5ff; border-bottom: 2px solid #007bff; }}
        tr:nth-child(even) {{ background-color: #f1f3f5; }}
        a {{ text-decoration: none; color: #007bff; }}
    </style>
</head>
<body>
    <h1>Index of {title}</h1>
    <table>
        <tr><th>Name</th><th>Size</th><th>Last Modified</th></tr>
"#
    );

    if request_path != "/" {
        html.push_str("        <tr><td><a href=\"../\">../</a></td><td>-</td><td>-</td></tr>\n");
    }

    let base = if request_path.ends_with('/') {
        request_path.to_string()
    } else {
        format!("{}/", request_path)
    };
    let base = utf8_percent_encode(&base, HREF_PATH).to_string();

    for entry in &entries {
        let href = utf8_percent_encode(&entry.name, HREF_SEGMENT);
        let name = escape_html(&entry.name);
        let time = entry.modified.map(format_time).unwrap_or_else(|| "-".to_string());
        if entry.is_dir {
            html.push_str(&format!(
                "        <tr><td><a href=\"{base}{href}/\">{name}/</a></td><td>-</td><td>{time}</td></tr>\n"
            ));
        } else {
            let size = format_size(entry.size);
            html.push_str(&format!(
                "        <tr><td><a href=\"{base}{href}\">{name}</a></td><td>{size}</td><td>{time}</td></tr>\n"
            ));
        }
    }

    html.push_str("    </table>\n</body>\n</html>\n");
    Ok(html)
}

/// Like [`HREF_SEGMENT`] but keeps the path separators.
const HREF_PATH: &AsciiSet = &HREF_SEGMENT.remove(b'/');

/// Human-readable size, base 1024, two decimals.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

fn format_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format("%Y-%m-%d %H:%M").to_string()
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
