use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use codemode::config::loader;
use codemode::tools::interface::INTERFACES_HEADER;
use codemode::{AGENT_PROMPT_TEMPLATE, Args, Capability, CapabilityError, CodeModeClient};
use serde_json::{Value, json};

type Calls = Arc<Mutex<HashMap<&'static str, Value>>>;

fn capability(name: &str, description: &str, inputs: Value, outputs: Value, tags: &[&str]) -> Capability {
    Capability::builder(name)
        .description(description)
        .inputs(inputs)
        .outputs(outputs)
        .tags(tags.iter().copied())
        .invocation_template(json!({ "call_template_type": "mock" }))
        .build()
        .unwrap()
}

fn add_numbers(a: &Value, b: &Value) -> Value {
    match (a.as_i64(), b.as_i64()) {
        (Some(a), Some(b)) => json!(a + b),
        _ => json!(a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default()),
    }
}

fn record(calls: &Calls, name: &'static str, args: &Args) {
    calls.lock().unwrap().insert(name, Value::Object(args.clone()));
}

fn client() -> (CodeModeClient, Calls) {
    let client = CodeModeClient::new();
    let calls: Calls = Arc::default();

    let recorder = Arc::clone(&calls);
    client.add_capability(
        capability(
            "test_tools.add",
            "Adds two numbers together",
            json!({
                "type": "object",
                "properties": {
                    "a": { "type": "number", "description": "First number" },
                    "b": { "type": "number", "description": "Second number" }
                },
                "required": ["a", "b"]
            }),
            json!({
                "type": "object",
                "properties": {
                    "result": { "type": "number", "description": "Sum of the numbers" },
                    "operation": { "type": "string", "description": "Type of operation" }
                },
                "required": ["result", "operation"]
            }),
            &["math", "arithmetic"],
        ),
        move |args: Args| {
            let calls = Arc::clone(&recorder);
            async move {
                record(&calls, "add", &args);
                let a = args.get("a").cloned().unwrap_or_default();
                let b = args.get("b").cloned().unwrap_or_default();
                Ok(json!({ "result": add_numbers(&a, &b), "operation": "addition" }))
            }
        },
    );

    let recorder = Arc::clone(&calls);
    client.add_capability(
        capability(
            "test_tools.greet",
            "Generates a greeting message",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Name to greet" },
                    "formal": { "type": "boolean", "description": "Whether to use formal greeting" }
                },
                "required": ["name"]
            }),
            json!({
                "type": "object",
                "properties": {
                    "greeting": { "type": "string", "description": "The greeting message" },
                    "is_formal": { "type": "boolean", "description": "Whether the greeting was formal" }
                },
                "required": ["greeting", "is_formal"]
            }),
            &["text", "greeting"],
        ),
        move |args: Args| {
            let calls = Arc::clone(&recorder);
            async move {
                record(&calls, "greet", &args);
                let name = args.get("name").and_then(Value::as_str).unwrap_or_default();
                let formal = args.get("formal").and_then(Value::as_bool).unwrap_or(false);
                let greeting = if formal {
                    format!("Good day, {name}")
                } else {
                    format!("Hey {name}!")
                };
                Ok(json!({ "greeting": greeting, "is_formal": formal }))
            }
        },
    );

    let recorder = Arc::clone(&calls);
    client.add_capability(
        capability(
            "test_tools.process_data",
            "Processes data with optional configuration",
            json!({
                "type": "object",
                "properties": {
                    "data": { "description": "Data to process" },
                    "options": { "type": "object", "description": "Processing options" }
                },
                "required": ["data"]
            }),
            json!({
                "type": "object",
                "properties": {
                    "processed_data": { "description": "The processed data" },
                    "metadata": { "type": "object", "description": "Processing metadata" }
                },
                "required": ["processed_data", "metadata"]
            }),
            &["processing", "data"],
        ),
        move |args: Args| {
            let calls = Arc::clone(&recorder);
            async move {
                record(&calls, "process_data", &args);
                let data = args.get("data").cloned().unwrap_or_default();
                let options = args.get("options").cloned().unwrap_or_else(|| json!({}));
                let item_count = data.as_array().map_or(1, Vec::len);
                let has_options = options.as_object().is_some_and(|o| !o.is_empty());
                let mut processed = data.as_object().cloned().unwrap_or_default();
                processed.insert("processed".into(), json!(true));
                processed.insert("options".into(), options);
                Ok(json!({
                    "processed_data": processed,
                    "metadata": { "item_count": item_count, "has_options": has_options }
                }))
            }
        },
    );

    let recorder = Arc::clone(&calls);
    client.add_capability(
        capability(
            "test_tools.sum_array",
            "Calculates sum and statistics of a number array",
            json!({
                "type": "object",
                "properties": {
                    "numbers": {
                        "type": "array",
                        "items": { "type": "number" },
                        "description": "Array of numbers to sum"
                    }
                },
                "required": ["numbers"]
            }),
            json!({
                "type": "object",
                "properties": {
                    "sum": { "type": "number", "description": "Sum of all numbers" },
                    "count": { "type": "number", "description": "Count of numbers" },
                    "average": { "type": "number", "description": "Average of numbers" }
                },
                "required": ["sum", "count", "average"]
            }),
            &["math", "array", "statistics"],
        ),
        move |args: Args| {
            let calls = Arc::clone(&recorder);
            async move {
                record(&calls, "sum_array", &args);
                let numbers: Vec<i64> = args
                    .get("numbers")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default();
                let total: i64 = numbers.iter().sum();
                let count = numbers.len();
                #[allow(clippy::cast_precision_loss)]
                let average = if count == 0 { 0.0 } else { total as f64 / count as f64 };
                Ok(json!({ "sum": total, "count": count, "average": average }))
            }
        },
    );

    let recorder = Arc::clone(&calls);
    client.add_capability(
        capability(
            "test_tools.get_current_time",
            "Gets the current timestamp",
            json!({ "type": "object", "properties": {}, "required": [] }),
            json!({
                "type": "object",
                "properties": {
                    "timestamp": { "type": "number", "description": "Unix timestamp" },
                    "iso": { "type": "string", "description": "ISO date string" }
                },
                "required": ["timestamp", "iso"]
            }),
            &["time", "utility"],
        ),
        move |args: Args| {
            let calls = Arc::clone(&recorder);
            async move {
                record(&calls, "get_current_time", &args);
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_millis())
                    .unwrap_or_default();
                Ok(json!({ "timestamp": u64::try_from(millis).unwrap_or(u64::MAX), "iso": "2024-01-01T00:00:00.000Z" }))
            }
        },
    );

    let recorder = Arc::clone(&calls);
    client.add_capability(
        capability(
            "test_tools.throw_error",
            "Throws an error for testing error handling",
            json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "Error message" }
                },
                "required": ["message"]
            }),
            json!({ "type": "object", "properties": {} }),
            &["testing", "error"],
        ),
        move |args: Args| {
            let calls = Arc::clone(&recorder);
            async move {
                record(&calls, "throw_error", &args);
                let message = args.get("message").and_then(Value::as_str).unwrap_or_default();
                Err(CapabilityError::execution(message))
            }
        },
    );

    (client, calls)
}

fn called(calls: &Calls, name: &str) -> Option<Value> {
    calls.lock().unwrap().get(name).cloned()
}

#[tokio::test]
async fn registered_capabilities_are_listed() {
    let (client, _calls) = client();
    let capabilities = client.list_capabilities();
    assert_eq!(capabilities.len(), 6);

    let leaves: Vec<&str> = capabilities
        .iter()
        .filter_map(|c| c.name().rsplit('.').next())
        .collect();
    for leaf in ["add", "greet", "process_data"] {
        assert!(leaves.contains(&leaf), "missing {leaf}");
    }
}

#[tokio::test]
async fn interface_text_for_one_capability() {
    let (client, _calls) = client();
    let add = client
        .list_capabilities()
        .into_iter()
        .find(|c| c.name().ends_with(".add"))
        .unwrap();

    let interface = client.describe(&add);
    assert!(interface.contains("namespace test_tools:"));
    assert!(interface.contains("async def add"));
    assert!(interface.contains("a (decimal): First number"));
    assert!(interface.contains("Adds two numbers together"));
    assert!(interface.ends_with("# Access as: test_tools.add(**kwargs)"));
}

#[tokio::test]
async fn interface_text_for_all_capabilities() {
    let (client, _calls) = client();
    let interfaces = client.describe_all();
    assert!(interfaces.starts_with(INTERFACES_HEADER));
    assert!(interfaces.contains("namespace test_tools:"));
    assert!(interfaces.contains("async def add"));
    assert!(interfaces.contains("async def greet"));
}

#[tokio::test]
async fn snippet_without_return_has_empty_result() {
    let (client, _calls) = client();
    let outcome = client.run("x = 5\ny = 10\nresult = x + y\n").await;
    assert_eq!(outcome.result(), None);
    assert!(outcome.logs().is_empty());
}

#[tokio::test]
async fn snippet_return_value_is_the_result() {
    let (client, _calls) = client();
    let outcome = client.run("x = 5\ny = 10\nreturn x + y\n").await;
    assert_eq!(outcome.result(), Some(&json!(15)));
}

#[tokio::test]
async fn snippet_calls_a_capability() {
    let (client, calls) = client();
    let code = r"
        result = await test_tools.add(a=15, b=25)
        return result
    ";
    let outcome = client.run(code).await;
    assert_eq!(outcome.result(), Some(&json!({ "result": 40, "operation": "addition" })));
    assert_eq!(called(&calls, "add"), Some(json!({ "a": 15, "b": 25 })));
}

#[tokio::test]
async fn snippet_combines_several_calls() {
    let (client, calls) = client();
    let code = r#"
        math_result = await test_tools.add(a=10, b=5)
        greet_result = await test_tools.greet(name="Alice", formal=True)

        return {
            'math': math_result,
            'greeting': greet_result,
            'combined': f"{greet_result['greeting']} The sum is {math_result['result']}"
        }
    "#;
    let outcome = client.run(code).await;
    let result = outcome.result().unwrap();
    assert_eq!(result["math"]["result"], json!(15));
    assert_eq!(result["greeting"]["greeting"], json!("Good day, Alice"));
    assert_eq!(result["greeting"]["is_formal"], json!(true));
    assert_eq!(result["combined"], json!("Good day, Alice The sum is 15"));
    assert!(called(&calls, "add").is_some());
    assert!(called(&calls, "greet").is_some());
}

#[tokio::test]
async fn nested_structures_pass_through() {
    let (client, calls) = client();
    let code = r"
        complex_data = {
            'users': [
                {'name': 'John', 'age': 30},
                {'name': 'Jane', 'age': 25}
            ],
            'settings': {'theme': 'dark', 'notifications': True}
        }

        result = await test_tools.process_data(
            data=complex_data,
            options={'validate': True, 'transform': 'uppercase'}
        )

        return result
    ";
    let outcome = client.run(code).await;
    let result = outcome.result().unwrap();
    assert_eq!(result["processed_data"]["processed"], json!(true));
    assert_eq!(result["processed_data"]["users"][1]["name"], json!("Jane"));
    assert_eq!(result["metadata"]["item_count"], json!(1));
    assert_eq!(result["metadata"]["has_options"], json!(true));
    let args = called(&calls, "process_data").unwrap();
    assert_eq!(args["options"], json!({ "validate": true, "transform": "uppercase" }));
}

#[tokio::test]
async fn arrays_round_trip() {
    let (client, calls) = client();
    let code = r"
        numbers = [1, 2, 3, 4, 5, 10]
        stats = await test_tools.sum_array(numbers=numbers)

        return {
            'original': numbers,
            'statistics': stats,
            'doubled': [n * 2 for n in numbers]
        }
    ";
    let outcome = client.run(code).await;
    let result = outcome.result().unwrap();
    assert_eq!(result["statistics"]["sum"], json!(25));
    assert_eq!(result["statistics"]["count"], json!(6));
    let average = result["statistics"]["average"].as_f64().unwrap();
    assert!((average - 25.0 / 6.0).abs() < 0.001);
    assert_eq!(result["doubled"], json!([2, 4, 6, 8, 10, 20]));
    assert_eq!(called(&calls, "sum_array"), Some(json!({ "numbers": [1, 2, 3, 4, 5, 10] })));
}

#[tokio::test]
async fn capability_errors_are_catchable() {
    let (client, _calls) = client();
    let code = r#"
        try:
            await test_tools.throw_error(message="Test error message")
            return {'error': False}
        except Exception as error:
            return {
                'error': True,
                'message': str(error),
                'caught': True
            }
    "#;
    let outcome = client.run(code).await;
    let result = outcome.result().unwrap();
    assert_eq!(result["error"], json!(true));
    assert_eq!(result["caught"], json!(true));
    assert!(result["message"].as_str().unwrap().contains("Test error message"));
}

#[tokio::test]
async fn uncaught_capability_errors_become_diagnostics() {
    let (client, _calls) = client();
    let outcome = client
        .run("print('calling')\nawait test_tools.throw_error(message='nope')")
        .await;
    assert_eq!(outcome.result(), None);
    assert_eq!(outcome.logs()[0], "calling");
    assert_eq!(
        outcome.logs()[1],
        "[ERROR] Code execution failed: CapabilityInvocationError: \
         Error calling capability 'test_tools.throw_error': nope (line 2)"
    );
}

#[tokio::test]
async fn runaway_snippets_time_out() {
    let (client, _calls) = client();
    let code = r"
        import asyncio
        while True:
            await asyncio.sleep(0.1)
        return {'completed': True}
    ";
    let outcome = client.run_with_timeout(code, Duration::from_secs(1)).await;
    assert_eq!(outcome.result(), None);
    assert!(outcome.logs().iter().any(|line| line.to_lowercase().contains("timed out")));
}

#[tokio::test]
async fn syntax_errors_are_reported() {
    let (client, _calls) = client();
    let outcome = client.run("invalid syntax here\nreturn result\n").await;
    assert_eq!(outcome.result(), None);
    assert!(outcome.logs().iter().any(|line| line.contains("[ERROR]")));
}

#[tokio::test]
async fn base_utilities_are_available() {
    let (client, _calls) = client();
    let code = r"
        import json

        return {
            'len_test': len([1, 2, 3]),
            'sum_test': sum([1, 2, 3, 4, 5]),
            'json_test': json.dumps({'test': True}),
            'list_comprehension': [x * 2 for x in range(5)]
        }
    ";
    let outcome = client.run(code).await;
    assert_eq!(
        outcome.result(),
        Some(&json!({
            "len_test": 3,
            "sum_test": 15,
            "json_test": "{\"test\": true}",
            "list_comprehension": [0, 2, 4, 6, 8]
        }))
    );
}

#[tokio::test]
async fn introspection_is_bound_in_the_snippet() {
    let (client, _calls) = client();
    let code = r"
        has_interfaces = isinstance(__interfaces, str)
        interfaces_contain_namespace = 'namespace test_tools:' in __interfaces
        can_get_interface = callable(__get_tool_interface)
        add_interface = __get_tool_interface('test_tools.add')

        return {
            'has_interfaces': has_interfaces,
            'interfaces_contain_namespace': interfaces_contain_namespace,
            'can_get_interface': can_get_interface,
            'add_interface_is_string': isinstance(add_interface, str) if add_interface else False
        }
    ";
    let outcome = client.run(code).await;
    assert_eq!(
        outcome.result(),
        Some(&json!({
            "has_interfaces": true,
            "interfaces_contain_namespace": true,
            "can_get_interface": true,
            "add_interface_is_string": true
        }))
    );
}

#[tokio::test]
async fn console_output_is_captured() {
    let (client, _calls) = client();
    let code = r"
        print('First log message')
        print('Number:', 42)
        print('Dictionary:', {'name': 'test', 'value': 123})

        result = await test_tools.add(a=10, b=20)
        print('Addition result:', result)

        return result['result']
    ";
    let outcome = client.run(code).await;
    assert_eq!(outcome.result(), Some(&json!(30)));
    assert_eq!(
        outcome.logs(),
        [
            "First log message",
            "Number: 42",
            "Dictionary: {'name': 'test', 'value': 123}",
            "Addition result: {'result': 30, 'operation': 'addition'}",
        ]
    );
}

#[tokio::test]
async fn chained_operations_feed_results_forward() {
    let (client, calls) = client();
    let code = r#"
        # Step 1: Get some numbers and process them
        numbers = [5, 10, 15, 20]
        array_stats = await test_tools.sum_array(numbers=numbers)

        # Step 2: Use the sum in another calculation
        add_result = await test_tools.add(a=array_stats['sum'], b=100)

        # Step 3: Create a greeting
        greeting = await test_tools.greet(name="CodeMode", formal=False)

        # Step 4: Process all data together
        final_data = await test_tools.process_data(
            data={
                'array_stats': array_stats,
                'add_result': add_result,
                'greeting': greeting
            },
            options={'include_metadata': True, 'format': 'enhanced'}
        )

        return {
            'steps': {
                'array_processing': array_stats,
                'addition': add_result,
                'greeting': greeting,
                'final_processing': final_data
            },
            'summary': {
                'original_sum': array_stats['sum'],
                'final_sum': add_result['result'],
                'greeting_message': greeting['greeting'],
                'chain_completed': True
            }
        }
    "#;
    let outcome = client.run_with_timeout(code, Duration::from_secs(15)).await;
    let result = outcome.result().unwrap();
    assert_eq!(result["steps"]["array_processing"]["sum"], json!(50));
    assert_eq!(result["steps"]["addition"]["result"], json!(150));
    assert_eq!(result["steps"]["greeting"]["greeting"], json!("Hey CodeMode!"));
    assert_eq!(
        result["steps"]["final_processing"]["processed_data"]["processed"],
        json!(true)
    );
    assert_eq!(result["summary"]["chain_completed"], json!(true));
    for name in ["sum_array", "add", "greet", "process_data"] {
        assert!(called(&calls, name).is_some(), "{name} was not called");
    }
}

#[tokio::test]
async fn gather_runs_calls_together() {
    let (client, _calls) = client();
    let code = r"
        results = await asyncio.gather(
            test_tools.add(a=1, b=2),
            test_tools.add(a=3, b=4),
            test_tools.get_current_time(),
        )
        return [results[0]['result'], results[1]['result'], results[2]['iso']]
    ";
    let outcome = client.run(code).await;
    assert_eq!(outcome.result(), Some(&json!([3, 7, "2024-01-01T00:00:00.000Z"])));
}

#[tokio::test]
async fn mapping_argument_form_is_accepted() {
    let (client, calls) = client();
    let outcome = client
        .run("return (await test_tools.add({'a': 2, 'b': 3}))['result']")
        .await;
    assert_eq!(outcome.result(), Some(&json!(5)));
    assert_eq!(called(&calls, "add"), Some(json!({ "a": 2, "b": 3 })));
}

#[tokio::test]
async fn concurrent_runs_keep_separate_logs() {
    let (client, _calls) = client();
    let first = client.spawn_run("for i in range(3):\n    print('first', i)\n    await asyncio.sleep(0.01)");
    let second = client.spawn_run("for i in range(3):\n    print('second', i)\n    await asyncio.sleep(0.01)");

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert_eq!(first.logs(), ["first 0", "first 1", "first 2"]);
    assert_eq!(second.logs(), ["second 0", "second 1", "second 2"]);
}

#[tokio::test]
async fn client_honours_loaded_configuration() {
    let config = loader::from_toml_str("default_timeout_secs = 0.5\nrecursion_limit = 8\n").unwrap();
    let client = CodeModeClient::with_config(&config).unwrap();

    let code = r"
        def depth(n):
            return depth(n + 1)
        try:
            depth(0)
        except RecursionError:
            return 'limited'
    ";
    let outcome = client.run(code).await;
    assert_eq!(outcome.result(), Some(&json!("limited")));

    let outcome = client.run("while True:\n    pass").await;
    assert_eq!(outcome.logs(), ["[ERROR] Code execution timed out after 0.5s"]);
}

#[test]
fn agent_prompt_template_describes_the_workflow() {
    assert!(!AGENT_PROMPT_TEMPLATE.is_empty());
    for needle in [
        "Tool Discovery Phase",
        "Interface Introspection",
        "Code Execution Guidelines",
        "await manual.tool",
        "__interfaces",
        "__get_tool_interface",
    ] {
        assert!(AGENT_PROMPT_TEMPLATE.contains(needle), "missing {needle}");
    }
}
