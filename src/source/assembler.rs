/// One logical record reassembled from one or more lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRecord {
    /// Lines joined with `\n`, without the final newline
    pub raw: String,
    /// File offset just past the newline of the record's last line
    pub end_offset: u64,
}

/// Groups lines into records using a continuation predicate.
///
/// A non-continuation line closes the group in progress and opens a new one.
/// The last group stays pending until the next boundary arrives or
/// [`LineAssembler::flush`] is called.
#[derive(Debug)]
pub struct LineAssembler {
    multiline: bool,
    pending: Vec<String>,
    pending_end: u64,
}

impl LineAssembler {
    /// With `multiline` false every line is its own record and nothing is
    /// ever held back.
    pub fn new(multiline: bool) -> Self {
        Self {
            multiline,
            pending: Vec::new(),
            pending_end: 0,
        }
    }

    pub fn push(
        &mut self,
        line: String,
        end_offset: u64,
        is_continuation: bool,
    ) -> Option<CompletedRecord> {
        if !self.multiline {
            return Some(CompletedRecord {
                raw: line,
                end_offset,
            });
        }

        let completed = if is_continuation {
            None
        } else {
            self.flush()
        };

        self.pending.push(line);
        self.pending_end = end_offset;
        completed
    }

    /// Close the group in progress, if any
    pub fn flush(&mut self) -> Option<CompletedRecord> {
        if self.pending.is_empty() {
            return None;
        }

        let raw = std::mem::take(&mut self.pending).join("\n");
        Some(CompletedRecord {
            raw,
            end_offset: self.pending_end,
        })
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop the group in progress without emitting it
    pub fn clear(&mut self) {
        self.pending.clear();
        self.pending_end = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(assembler: &mut LineAssembler, lines: &[&str]) -> Vec<CompletedRecord> {
        let mut offset = 0;
        let mut out = Vec::new();
        for line in lines {
            offset += line.len() as u64 + 1;
            let continuation = line.starts_with(' ');
            out.extend(assembler.push(line.to_string(), offset, continuation));
        }
        out
    }

    #[test]
    fn test_stack_trace_is_joined_with_its_header() {
        let mut assembler = LineAssembler::new(true);
        let lines = [
            "2020-01-01T00:00:00 INFO started",
            " stack trace line 1",
            " stack trace line 2",
            "2020-01-01T00:00:01 INFO done",
        ];

        let completed = feed(&mut assembler, &lines);
        assert_eq!(completed.len(), 1);
        assert_eq!(
            completed[0].raw,
            "2020-01-01T00:00:00 INFO started\n stack trace line 1\n stack trace line 2"
        );
        assert_eq!(completed[0].end_offset, 33 + 20 + 20);

        // Last record waits for a boundary
        assert!(assembler.has_pending());
        let last = assembler.flush().unwrap();
        assert_eq!(last.raw, "2020-01-01T00:00:01 INFO done");
        assert_eq!(last.end_offset, 33 + 20 + 20 + 30);
        assert!(assembler.flush().is_none());
    }

    #[test]
    fn test_single_line_mode_emits_immediately() {
        let mut assembler = LineAssembler::new(false);
        let completed = feed(&mut assembler, &["a", " b", "c"]);

        let raws: Vec<&str> = completed.iter().map(|r| r.raw.as_str()).collect();
        assert_eq!(raws, vec!["a", " b", "c"]);
        assert!(!assembler.has_pending());
    }

    #[test]
    fn test_leading_continuation_starts_a_group() {
        let mut assembler = LineAssembler::new(true);
        let completed = feed(&mut assembler, &[" orphan", " more", "next"]);

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].raw, " orphan\n more");
    }

    #[test]
    fn test_clear_discards_pending() {
        let mut assembler = LineAssembler::new(true);
        feed(&mut assembler, &["head", " tail"]);
        assembler.clear();

        assert!(!assembler.has_pending());
        assert!(assembler.flush().is_none());
    }
}
