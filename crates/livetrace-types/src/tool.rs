use serde::{Deserialize, Serialize};

/// Semantic grouping of host tools. The mapping is case-sensitive on the
/// tool name; anything unrecognized lands in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Bash,
    FileRead,
    FileWrite,
    Search,
    Agent,
    Planning,
    Web,
    Interaction,
    Other,
}

impl ToolCategory {
    pub fn of(tool_name: &str) -> Self {
        match tool_name {
            "Bash" | "KillShell" => ToolCategory::Bash,
            "Read" => ToolCategory::FileRead,
            "Write" | "Edit" | "NotebookEdit" => ToolCategory::FileWrite,
            "Glob" | "Grep" => ToolCategory::Search,
            "Task" | "TaskOutput" => ToolCategory::Agent,
            "TodoWrite" | "EnterPlanMode" | "ExitPlanMode" => ToolCategory::Planning,
            "WebFetch" | "WebSearch" => ToolCategory::Web,
            "AskUserQuestion" => ToolCategory::Interaction,
            _ => ToolCategory::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Bash => "bash",
            ToolCategory::FileRead => "file_read",
            ToolCategory::FileWrite => "file_write",
            ToolCategory::Search => "search",
            ToolCategory::Agent => "agent",
            ToolCategory::Planning => "planning",
            ToolCategory::Web => "web",
            ToolCategory::Interaction => "interaction",
            ToolCategory::Other => "other",
        }
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ToolCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bash" => Ok(ToolCategory::Bash),
            "file_read" => Ok(ToolCategory::FileRead),
            "file_write" => Ok(ToolCategory::FileWrite),
            "search" => Ok(ToolCategory::Search),
            "agent" => Ok(ToolCategory::Agent),
            "planning" => Ok(ToolCategory::Planning),
            "web" => Ok(ToolCategory::Web),
            "interaction" => Ok(ToolCategory::Interaction),
            "other" => Ok(ToolCategory::Other),
            _ => Err(format!("unknown tool category: {}", s)),
        }
    }
}
