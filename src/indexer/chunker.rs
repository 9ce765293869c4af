use super::code_parser::Span;
use crate::config::ChunkingConfig;

/// A unit of source text before it is embedded. Lines are 1-based, inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCandidate {
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub symbol: Option<String>,
}

impl ChunkCandidate {
    pub fn line_count(&self) -> usize {
        self.end_line - self.start_line + 1
    }
}

/// Splits source text into overlapping units, following declaration
/// boundaries when structural spans are available.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_lines: usize,
    overlap_lines: usize,
    max_lines: usize,
    min_lines: usize,
}

impl Chunker {
    pub fn new(chunk_lines: usize, overlap_lines: usize, max_lines: usize, min_lines: usize) -> Self {
        let chunk_lines = chunk_lines.max(1);
        Self {
            chunk_lines,
            overlap_lines: overlap_lines.min(chunk_lines - 1),
            max_lines: max_lines.max(chunk_lines),
            min_lines,
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(
            config.chunk_lines,
            config.overlap_lines,
            config.max_lines,
            config.min_lines,
        )
    }

    pub fn chunk(&self, text: &str, spans: Option<&[Span]>) -> Vec<ChunkCandidate> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let lines: Vec<&str> = text.lines().collect();
        let total = lines.len();

        match spans {
            Some(spans) if !spans.is_empty() => {
                if total <= self.min_lines {
                    return vec![candidate(&lines, 1, total, None)];
                }
                self.chunk_by_spans(&lines, spans)
            }
            _ => {
                if total <= self.chunk_lines {
                    return vec![candidate(&lines, 1, total, None)];
                }
                self.windows(&lines, 1, total, None)
            }
        }
    }

    /// Fixed windows of `chunk_lines` over `[from, to]`, each overlapping the
    /// previous one by `overlap_lines`.
    fn windows(
        &self,
        lines: &[&str],
        from: usize,
        to: usize,
        symbol: Option<&str>,
    ) -> Vec<ChunkCandidate> {
        let step = self.chunk_lines - self.overlap_lines;
        let mut out = Vec::new();
        let mut start = from;
        while start <= to {
            let end = (start + self.chunk_lines - 1).min(to);
            out.push(candidate(lines, start, end, symbol));
            if end == to {
                break;
            }
            start += step;
        }
        out
    }

    fn chunk_by_spans(&self, lines: &[&str], spans: &[Span]) -> Vec<ChunkCandidate> {
        let total = lines.len();

        let mut sorted: Vec<&Span> = spans
            .iter()
            .filter(|s| s.start_line >= 1 && s.start_line <= total && s.end_line >= s.start_line)
            .collect();
        sorted.sort_by_key(|s| (s.start_line, std::cmp::Reverse(s.end_line)));

        let mut outermost: Vec<(usize, usize, Option<&str>)> = Vec::new();
        let mut covered_to = 0;
        for span in sorted {
            if span.start_line > covered_to {
                let end = span.end_line.min(total);
                outermost.push((span.start_line, end, span.symbol.as_deref()));
                covered_to = end;
            }
        }

        let mut out = Vec::new();
        let mut cursor = 1;
        for (start, end, symbol) in outermost {
            if start > cursor {
                self.push_gap(&mut out, lines, cursor, start - 1);
            }

            let len = end - start + 1;
            if len > self.max_lines {
                out.extend(self.windows(lines, start, end, symbol));
            } else {
                let room = self.max_lines - len;
                let context = self.overlap_lines.min(room).min(start - 1);
                out.push(candidate(lines, start - context, end, symbol));
            }
            cursor = end + 1;
        }
        if cursor <= total {
            self.push_gap(&mut out, lines, cursor, total);
        }
        out
    }

    fn push_gap(&self, out: &mut Vec<ChunkCandidate>, lines: &[&str], from: usize, to: usize) {
        if lines[from - 1..to].iter().all(|l| l.trim().is_empty()) {
            return;
        }
        out.extend(self.windows(lines, from, to, None));
    }
}

fn candidate(lines: &[&str], start: usize, end: usize, symbol: Option<&str>) -> ChunkCandidate {
    ChunkCandidate {
        start_line: start,
        end_line: end,
        text: lines[start - 1..end].join("\n"),
        symbol: symbol.map(str::to_string),
    }
}
