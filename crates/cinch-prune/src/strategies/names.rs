//! Tool-name sets the heuristics classify calls by.
//!
//! Hosts name their file tools differently, so each set lists the common
//! spellings. Matching is case-insensitive.

pub const READ_TOOLS: &[&str] = &["read", "read_file", "view"];

pub const WRITE_TOOLS: &[&str] = &[
    "write",
    "edit",
    "multiedit",
    "write_file",
    "edit_file",
    "patch",
    "apply_patch",
];

pub const BATCH: &str = "batch";

pub fn is_read_tool(tool: &str) -> bool {
    READ_TOOLS.iter().any(|t| t.eq_ignore_ascii_case(tool))
}

pub fn is_write_tool(tool: &str) -> bool {
    WRITE_TOOLS.iter().any(|t| t.eq_ignore_ascii_case(tool))
}

pub fn is_file_tool(tool: &str) -> bool {
    is_read_tool(tool) || is_write_tool(tool)
}
