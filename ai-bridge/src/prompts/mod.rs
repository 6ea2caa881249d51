pub fn build_code_review_prompt(code: &str, focus: &str) -> String {
    format!(
        r#"Please review this code with a focus on {}:

```
{}
```

Provide specific, actionable feedback on:
1. Potential issues or bugs
2. Security concerns
3. Performance optimizations
4. Best practices
5. Code clarity and maintainability"#,
        focus, code
    )
}

pub fn build_brainstorm_prompt(topic: &str, context: Option<&str>) -> String {
    let mut prompt = format!("Let's brainstorm about: {}", topic);
    if let Some(context) = context.filter(|c| !c.is_empty()) {
        prompt.push_str(&format!("\n\nContext: {}", context));
    }
    prompt.push_str("\n\nProvide creative ideas, alternatives, and considerations.");
    prompt
}
