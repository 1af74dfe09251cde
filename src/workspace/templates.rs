//! Role templates embedded at compile time.
//!
//! Template content is inlined so the binary is fully self-contained: a
//! fresh workspace is seeded from `_base` plus the role's file set. Seeding
//! never overwrites files that already exist, so user customisations
//! survive upgrades.

/// Base system prompt written into `agent.json` at init. Deliberately
/// role-free: the role fragment lives in `prompt.md`, which the
/// inherited-state reset can swap without touching this.
pub const BASE_SYSTEM_PROMPT: &str = "You are a persistent agent living in a workspace \
directory that defines everything about you: configuration, prompt, tools, provider \
access, memory, and message routing. You act exclusively through tool calls. Inbound \
messages are tagged [source]; reply to a source with the `reply` tool. Call `wait_for` \
when you are done and want to sleep until the next message. You may read and rewrite any \
file in your workspace, including your own configuration and tools; changes take effect \
on your next round.";

/// One seedable template file.
pub struct TemplateFile {
    /// Path relative to the workspace root.
    pub path: &'static str,
    pub contents: &'static str,
    /// Whether to set the executable bit (tool scripts).
    pub executable: bool,
}

/// Files shared by every role.
pub static BASE_FILES: &[TemplateFile] = &[
    TemplateFile {
        path: "scripts/providers/openai.json",
        contents: include_str!("../../templates/_base/scripts/providers/openai.json"),
        executable: false,
    },
    TemplateFile {
        path: "scripts/tools/datetime",
        contents: include_str!("../../templates/_base/scripts/tools/datetime"),
        executable: true,
    },
    TemplateFile {
        path: "skills/workspace-guide/SKILL.md",
        contents: include_str!("../../templates/_base/skills/workspace-guide/SKILL.md"),
        executable: false,
    },
];

/// Worker-role files.
pub static WORKER_FILES: &[TemplateFile] = &[TemplateFile {
    path: "prompt.md",
    contents: include_str!("../../templates/worker/prompt.md"),
    executable: false,
}];

/// Root-role files.
pub static ROOT_FILES: &[TemplateFile] = &[
    TemplateFile {
        path: "prompt.md",
        contents: include_str!("../../templates/root/prompt.md"),
        executable: false,
    },
    TemplateFile {
        path: "skills/spawn-worker/SKILL.md",
        contents: include_str!("../../templates/root/skills/spawn-worker/SKILL.md"),
        executable: false,
    },
];

/// The worker prompt fragment, used directly by the inherited-state reset.
pub const WORKER_PROMPT: &str = include_str!("../../templates/worker/prompt.md");

pub fn files_for_role(role: &str) -> &'static [TemplateFile] {
    match role {
        "root" => ROOT_FILES,
        _ => WORKER_FILES,
    }
}
