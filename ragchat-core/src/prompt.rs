//! Built-in few-shot prompt placed before every grounded question.

use crate::context::AssembledContext;
use crate::types::ChatMessage;

const SYSTEM_PROMPT: &str = "You are a helpful assistant. When given CONTEXT you answer questions \
using only that information, and you always format your output in markdown. Include code snippets \
when relevant. If the answer is not explicitly written in the CONTEXT provided, say \
\"Sorry, I don't know how to help with that.\" If the CONTEXT includes source URLs, list them under \
a SOURCES heading at the end of your response. Include every relevant source URL from the CONTEXT, \
never list a URL more than once (ignore trailing slashes when comparing), and never include URLs \
that are not in the CONTEXT.";

const EXAMPLE_QUESTION: &str = "CONTEXT:
Next.js is a React framework for creating production-ready web applications. It provides a variety \
of methods for fetching data, a built-in router, and a Next.js Compiler for transforming and \
minifying JavaScript code. It also includes a built-in Image Component and Automatic Image \
Optimization for resizing, optimizing, and serving images in modern formats.
SOURCE: nextjs.org/docs/faq
---

USER QUESTION:
what is nextjs?
";

const EXAMPLE_ANSWER: &str = "Next.js is a framework for building production-ready web \
applications using React. It offers several data fetching options, an integrated router, and a \
compiler for transforming and minifying JavaScript. It also ships an Image Component with automatic \
optimization for resizing and serving images in modern formats.
```js
function HomePage() {
  return <div>Welcome to Next.js!</div>
}
export default HomePage
```
SOURCES:
https://nextjs.org/docs/faq";

/// The prompt used when no named prompt is configured: a system instruction
/// followed by one worked question/answer pair.
pub fn default_prompt() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(EXAMPLE_QUESTION),
        ChatMessage::assistant(EXAMPLE_ANSWER),
    ]
}

/// Messages for one generation request: the prompt, then the grounded question.
pub fn build_request(prompt: &[ChatMessage], context: &AssembledContext) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(prompt.len() + 1);
    messages.extend_from_slice(prompt);
    messages.push(ChatMessage::user(context.render()));
    messages
}
