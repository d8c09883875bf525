use crate::completion::StyleHints;
use crate::model::{ConversationContext, ConversationType};
use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const INTERVIEW: &str = "You are a warm, curious interviewer helping {author} write their memoir, \"{book}\".
Ask about specific memories: people, places, sights, sounds and feelings. Ask one question at a time.

Goals:
{goals}

What you know about the author and the book:
{context}
";

const REFLECTION: &str = "You are a thoughtful companion helping {author} reflect on their life for the memoir \"{book}\".
Help them explore what their experiences meant and how those experiences shaped them. Ask one question at a time.

Goals:
{goals}

What you know about the author and the book:
{context}
";

const BRAINSTORMING: &str = "You are a creative writing partner brainstorming the memoir \"{book}\" with {author}.
Suggest angles, themes and chapter ideas, and ask what resonates. Keep suggestions concrete.

Goals:
{goals}

What you know about the author and the book:
{context}
";

const OPENING: &str = "Open the conversation with a short greeting and your first question.";

const STYLE: &str = "Style for this reply: {style_guidance}
Do not repeat any of these questions you have already asked:
{avoid_questions}";

const VOICE: &str = "{system}
You are speaking out loud. Keep each turn to two or three sentences.";

/// Prompt templates keyed by name, with `{placeholder}` substitution.
///
/// Built-in templates can be overridden by `.md` files in a directory; the
/// file stem is the template name.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    templates: HashMap<String, String>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        let templates = [
            ("interview", INTERVIEW),
            ("reflection", REFLECTION),
            ("brainstorming", BRAINSTORMING),
            ("opening", OPENING),
            ("style", STYLE),
            ("voice", VOICE),
        ]
        .into_iter()
        .map(|(name, body)| (name.to_string(), body.to_string()))
        .collect();
        Self { templates }
    }
}

impl PromptLibrary {
    /// Built-in templates overridden by the `.md` files in `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut library = Self::default();
        library.templates.extend(load_prompts(dir)?);
        Ok(library)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.templates.get(name).map(String::as_str)
    }

    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> Result<String> {
        let template = self
            .get(name)
            .ok_or_else(|| anyhow!("no prompt template named '{name}'"))?;
        Ok(render_template(template, vars))
    }

    /// The system prompt of a text turn.
    pub fn system_prompt(
        &self,
        conversation_type: ConversationType,
        context: &ConversationContext,
        hints: Option<&StyleHints>,
    ) -> Result<String> {
        let author = context
            .user_profile
            .display_name
            .clone()
            .unwrap_or_else(|| "the author".to_string());
        let goals = conversation_type
            .goals()
            .iter()
            .map(|g| format!("- {g}"))
            .collect::<Vec<_>>()
            .join("\n");
        let described = context.describe();
        let mut prompt = self.render(
            conversation_type.as_str(),
            &[
                ("author", author.as_str()),
                ("book", context.book_profile.title.as_str()),
                ("goals", goals.as_str()),
                ("context", described.as_str()),
            ],
        )?;

        if let Some(hints) = hints {
            let avoid = if hints.avoid_questions.is_empty() {
                "(none yet)".to_string()
            } else {
                hints
                    .avoid_questions
                    .iter()
                    .map(|q| format!("- {q}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            prompt.push('\n');
            prompt.push_str(&self.render(
                "style",
                &[
                    ("style_guidance", hints.style.guidance()),
                    ("avoid_questions", avoid.as_str()),
                ],
            )?);
        }
        Ok(prompt)
    }

    /// Instructions sent to the realtime voice session.
    pub fn voice_instructions(
        &self,
        conversation_type: ConversationType,
        context: &ConversationContext,
    ) -> Result<String> {
        let system = self.system_prompt(conversation_type, context, None)?;
        self.render("voice", &[("system", system.as_str())])
    }
}

fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

pub fn load_prompts(dir_path: &Path) -> Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read prompts directory: {}", dir_path.display()))?
    {
        let path = entry?.path();

        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem for prompt file")?
                .to_string();

            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;

            prompts.insert(prompt_key, content);
        }
    }

    Ok(prompts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::ConversationStyle;
    use crate::model::UserProfile;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_load_prompts_only_reads_markdown_files() -> Result<()> {
        let dir = tempdir()?;
        let dir_path = dir.path();

        // `{{...}}` in `writeln!` writes a single-brace placeholder.
        let mut file1 = File::create(dir_path.join("opening.md"))?;
        writeln!(file1, "Say hello to {{author}}.")?;
        let mut ignored = File::create(dir_path.join("config.txt"))?;
        writeln!(ignored, "some config")?;
        std::fs::create_dir(dir_path.join("subdir"))?;

        let prompts = load_prompts(dir_path)?;

        assert_eq!(prompts.len(), 1, "Should only load .md files");
        assert_eq!(prompts.get("opening").unwrap(), "Say hello to {author}.\n");
        assert!(prompts.get("config").is_none());
        Ok(())
    }

    #[test]
    fn test_load_prompts_from_nonexistent_dir() {
        let result = load_prompts(Path::new("nonexistent_dir_for_testing_prompts"));
        assert!(result.is_err());
    }

    #[test]
    fn test_directory_overrides_builtin_templates() -> Result<()> {
        let dir = tempdir()?;
        let mut file = File::create(dir.path().join("interview.md"))?;
        write!(file, "Interview {{author}} about {{book}}.")?;

        let library = PromptLibrary::from_dir(dir.path())?;
        let context = ConversationContext {
            user_profile: UserProfile {
                display_name: Some("Margaret".to_string()),
                ..UserProfile::placeholder("u1")
            },
            ..Default::default()
        };

        let prompt = library.system_prompt(ConversationType::Interview, &context, None)?;
        assert_eq!(prompt, "Interview Margaret about .");
        // Templates not in the directory keep their built-in text.
        assert_eq!(library.get("opening"), Some(OPENING));
        Ok(())
    }

    #[test]
    fn test_style_hints_are_appended() -> Result<()> {
        let library = PromptLibrary::default();
        let hints = StyleHints {
            style: ConversationStyle::Concise,
            avoid_questions: vec!["Where were you born?".to_string()],
        };

        let prompt = library.system_prompt(
            ConversationType::Reflection,
            &ConversationContext::default(),
            Some(&hints),
        )?;

        assert!(prompt.contains(ConversationStyle::Concise.guidance()));
        assert!(prompt.contains("- Where were you born?"));
        assert!(prompt.contains("Explore what past experiences meant"));
        assert!(!prompt.contains('{'));
        Ok(())
    }

    #[test]
    fn test_render_reports_missing_template() {
        let library = PromptLibrary::default();
        assert!(library.render("nope", &[]).is_err());
        assert_eq!(
            render_template("{a} and {b} and {a}", &[("a", "x"), ("b", "y")]),
            "x and y and x"
        );
    }
}
