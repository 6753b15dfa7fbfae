const TEMPLATE_HEAD: &str = "\
You are a GUI agent. You are given a task and your action history, with screenshots. \
You need to perform the next action to complete the task.

## Output Format
```
Thought: ...
Action: ...
```

## Action Space
";

/// Default system prompt advertising `action_spaces` to the model.
pub fn build_system_prompt(action_spaces: &[String], language: &str) -> String {
    let mut prompt = String::from(TEMPLATE_HEAD);
    for signature in action_spaces {
        prompt.push_str(signature);
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "\n## Note\n\
         - Use {language} in `Thought` part.\n\
         - Write a small plan and finally summarize your next action (with its target element) in one sentence in `Thought` part.\n\n\
         ## User Instruction\n"
    ));
    prompt
}
