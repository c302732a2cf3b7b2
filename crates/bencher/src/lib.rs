//! Fixtures shared by the parser benchmarks.

/// A request head fixture embedded at compile time.
#[derive(Debug, Copy, Clone)]
pub struct TestFile {
    file_name: &'static str,
    content: &'static str,
}

impl TestFile {
    pub const fn new(file_name: &'static str, content: &'static str) -> Self {
        Self { file_name, content }
    }

    pub fn file_name(&self) -> &'static str {
        self.file_name
    }

    pub fn bytes(&self) -> &'static [u8] {
        self.content.as_bytes()
    }

    /// Header lines in the fixture, not counting the request line and the blank line.
    pub fn header_count(&self) -> usize {
        self.content.split("\r\n").skip(1).take_while(|line| !line.is_empty()).count()
    }
}

/// How a fixture is handed to the parser.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChunkPlan {
    /// One `execute` call with the whole fixture
    Whole,
    /// Consecutive `execute` calls of at most this many bytes
    Fixed(usize),
}

impl ChunkPlan {
    pub fn chunks(self, bytes: &[u8]) -> Vec<&[u8]> {
        match self {
            ChunkPlan::Whole => vec![bytes],
            ChunkPlan::Fixed(size) => bytes.chunks(size.max(1)).collect(),
        }
    }

    pub fn label(self) -> String {
        match self {
            ChunkPlan::Whole => "whole".to_string(),
            ChunkPlan::Fixed(size) => format!("chunk_{size}"),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TestCase {
    file: TestFile,
    plan: ChunkPlan,
}

impl TestCase {
    pub fn new(file: TestFile, plan: ChunkPlan) -> Self {
        Self { file, plan }
    }

    pub fn file(&self) -> &TestFile {
        &self.file
    }

    pub fn plan(&self) -> ChunkPlan {
        self.plan
    }

    /// `<fixture>/<plan>`, used as the benchmark parameter.
    pub fn name(&self) -> String {
        format!("{}/{}", self.file.file_name().trim_end_matches(".txt"), self.plan.label())
    }
}
