//! Tool-name table shared by the repair engine and the persistence
//! writer.

use serde_json::Map;

/// Batch content generation: one call, many sections.
pub const BATCH_GENERATE_SECTIONS: &str = "batch_generate_sections";
/// First-time content generation for a single section.
pub const GENERATE_SECTION_CONTENT: &str = "generate_section_content";
/// Rewrite/polish/extend an existing section.
pub const UPDATE_SECTION_CONTENT: &str = "update_section_content";
/// Structure edits; not content-producing.
pub const ADD_SUBSECTION: &str = "add_subsection";
pub const DELETE_SECTION: &str = "delete_section";
/// Single-free-field planning tool; its arguments are the most frequently
/// mangled payload the engine produces.
pub const PLAN_STEP: &str = "plan_step";

/// Synthetic names for content captured out of assistant text rather than
/// a real tool call.
pub const INLINE_SECTION_CAPTURE: &str = "inline_section_capture";
pub const INLINE_OUTLINE_CAPTURE: &str = "inline_outline_capture";

/// Tool outcomes that may carry document content for the merge
/// side-channel.
pub const CONTENT_TOOLS: &[&str] = &[
    GENERATE_SECTION_CONTENT,
    UPDATE_SECTION_CONTENT,
    BATCH_GENERATE_SECTIONS,
    INLINE_SECTION_CAPTURE,
    INLINE_OUTLINE_CAPTURE,
];

pub fn is_content_tool(name: &str) -> bool {
    CONTENT_TOOLS.contains(&name)
}

/// Infer a tool name from the shape of repaired arguments. Used when the
/// engine emitted an invocation with an empty name.
pub fn infer_name_from_shape(args: &Map<String, serde_json::Value>) -> Option<&'static str> {
    if args.get("sections").map(|v| v.is_array()).unwrap_or(false) {
        return Some(BATCH_GENERATE_SECTIONS);
    }
    if args.contains_key("section_id") {
        if args.contains_key("existing_content") {
            return Some(UPDATE_SECTION_CONTENT);
        }
        return Some(GENERATE_SECTION_CONTENT);
    }
    None
}
