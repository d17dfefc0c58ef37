//! Usage guide handed to agents that write snippets.

/// Instructions describing how an agent should discover, inspect and call
/// capabilities from a snippet.
pub const AGENT_PROMPT_TEMPLATE: &str = "\
## Code Mode Capability Guide

You can run short snippets that call registered capabilities directly. Work \
through the steps below.

### 1. Tool Discovery Phase
- Capabilities are grouped by manual namespace, named `manual.tool`.
- Call them through that namespace: `await manual.tool(param=value)`.
- Two manuals may both define a tool with the same name; the namespace keeps \
them apart.

### 2. Interface Introspection
- `__interfaces` holds the interface text of every registered capability.
- `__get_tool_interface('manual.tool')` returns the text for one capability, \
or `None` when no capability has that name.
- Each interface lists inputs, outputs and tags, and ends with an \
`# Access as: manual.tool(**kwargs)` line.

### 3. Code Execution Guidelines
- Every capability call is asynchronous: write `await manual.tool(param=value)`.
- Arguments are keyword arguments, or one mapping passed positionally.
- Results come back as mappings.
- `print`, `len`, `sum`, `sorted`, comprehensions and the `json`, `math`, \
`asyncio` and `time` modules are available.
- Everything printed is captured and returned in order as the run's logs.
- End the snippet with `return value` to hand a result back.
- A failing capability raises `CapabilityInvocationError`; an unknown name \
raises `CapabilityNotFound`. Catch them with `try`/`except`.
- Independent calls can run together with `await asyncio.gather(...)`.

### 4. Best Practices
- Read the interfaces before writing code.
- Use full `manual.tool` paths.
- Build inputs from the documented argument names and types.
- Feed the output of one call into the next to chain work in a single run.

### 5. Available Runtime Context
- `__interfaces`: text of every capability interface.
- `__get_tool_interface(tool_name)`: interface text for one capability.
- Every registered capability, reachable as `manual.tool`.
- The built-in functions and modules listed above.

Discover and understand the available capabilities before running code \
that uses them.";
