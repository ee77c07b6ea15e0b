/// A raised runtime error: the message plus the call depth and remaining
/// ticks captured at the throw site. Fatal conditions (allocator
/// corruption, out of memory) panic instead and never take this form.
#[derive(Debug, Clone)]
pub struct Error {
    pub message: String,
    pub depth: u32,
    pub ticks: i64,
}

impl Error {
    pub fn new(message: impl Into<String>, depth: u32, ticks: i64) -> Self {
        Error { message: message.into(), depth, ticks }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}
