use std::io::{self, Write};

use crossterm::style::Stylize;
use unicode_width::UnicodeWidthStr;

use podtail_types::EventSource;

use crate::theme::Theme;

const HEADERS: [&str; 4] = ["NAMESPACE", "NAME", "CONTAINER", "NODE"];
const GAP: usize = 3;

/// Print the sources that would be followed as an aligned table
pub fn write_sources<W: Write>(out: &mut W, sources: &[EventSource], color: bool) -> io::Result<()> {
    let rows: Vec<[&str; 4]> = sources
        .iter()
        .map(|s| [s.namespace(), s.name(), s.container(), s.node()])
        .collect();

    let mut widths = HEADERS.map(|h| h.width());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.width());
        }
    }

    let header = format_row(&HEADERS, &widths);
    if color {
        writeln!(out, "{}", header.with(Theme::HEADER))?;
    } else {
        writeln!(out, "{header}")?;
    }
    for row in &rows {
        writeln!(out, "{}", format_row(row, &widths))?;
    }
    Ok(())
}

fn format_row(cells: &[&str; 4], widths: &[usize; 4]) -> String {
    let mut line = String::new();
    for (i, (cell, width)) in cells.iter().zip(widths).enumerate() {
        line.push_str(cell);
        if i + 1 < cells.len() {
            let pad = width - cell.width() + GAP;
            line.extend(std::iter::repeat_n(' ', pad));
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use podtail_types::ResourceId;

    #[test]
    fn test_columns_align() {
        let sources = vec![
            EventSource::new(ResourceId::new("default", "web-1"), "app", "node-1"),
            EventSource::new(ResourceId::new("kube-system", "dns"), "coredns", "node-22"),
        ];
        let mut out = Vec::new();
        write_sources(&mut out, &sources, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("NAMESPACE     NAME    CONTAINER   NODE"));
        assert_eq!(lines[1], "default       web-1   app         node-1");
        assert_eq!(lines[2], "kube-system   dns     coredns     node-22");
    }

    #[test]
    fn test_wide_characters() {
        let sources = vec![EventSource::new(ResourceId::new("ns", "名前"), "c", "n")];
        let mut out = Vec::new();
        write_sources(&mut out, &sources, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        // "名前" is four columns wide, the NAME header sets the width
        assert_eq!(text.lines().nth(1), Some("ns          名前   c           n"));
    }

    #[test]
    fn test_empty_table_has_header() {
        let mut out = Vec::new();
        write_sources(&mut out, &[], false).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "NAMESPACE   NAME   CONTAINER   NODE\n");
    }
}
