//! Session lifecycle tests against a host registry.

use std::sync::Barrier;
use std::thread;

use cscript::core::registry::SymbolKind;
use cscript::host::register_c_runtime;
use cscript::{
    CompileError, CompileOptions, ExecuteError, LinkError, Location, Registry, RegistryError, Session,
    SessionError, SessionState, Stage, Value,
};

extern "C" fn add(a: i32, b: i32) -> i32 {
    a + b
}

extern "C" fn triple(x: i64) -> i64 {
    x * 3
}

static HELLO: [u8; 6] = *b"hello\0";

const HOST_PROGRAM: &str = "
    int add(int, int);
    DLL_IMPORT_DATA const char hello[];
    int first_plus(int n) { return add(hello[0], n); }
";

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn host_registry() -> Registry {
    init_logger();
    let registry = Registry::new(false);
    registry.register_function("add", add as usize).unwrap();
    registry.register_data("hello", &HELLO).unwrap();
    registry
}

#[test]
fn test_host_function_and_data() {
    let registry = host_registry();
    let mut session = Session::new(&registry);
    let options = CompileOptions::default().define("DLL_IMPORT_DATA", "extern");
    session.compile(HOST_PROGRAM, &options).unwrap();
    assert_eq!(session.state(), SessionState::Compiled);

    session.link_and_load().unwrap();
    assert_eq!(session.state(), SessionState::Loaded);
    assert_eq!(session.execute("first_plus", &[Value::Int(1)]).unwrap(), Value::Int(105));
    assert_eq!(session.stats().externals_resolved, 2);
}

#[test]
fn test_host_c_runtime() {
    init_logger();
    let registry = Registry::new(false);
    register_c_runtime(&registry).unwrap();
    let source = "
        unsigned long strlen(const char *s);
        int strcmp(const char *a, const char *b);
        int abs(int x);
        long len(void) { return strlen(\"cscript\"); }
        int same(void) { return strcmp(\"abc\", \"abc\") == 0; }
        int magnitude(int x) { return abs(x); }
    ";
    let mut session = Session::new(&registry);
    session.compile(source, &CompileOptions::default()).unwrap();
    session.link_and_load().unwrap();

    assert_eq!(session.execute("len", &[]).unwrap(), Value::Int(7));
    assert_eq!(session.execute("same", &[]).unwrap(), Value::Int(1));
    assert_eq!(session.execute("magnitude", &[Value::Int(-12)]).unwrap(), Value::Int(12));
}

#[test]
fn test_missing_symbol_then_retry() {
    init_logger();
    let registry = Registry::new(false);
    let source = "long triple(long); long nine(void) { return triple(3); }";

    let mut session = Session::new(&registry);
    session.compile(source, &CompileOptions::default()).unwrap();
    let err = session.link_and_load().unwrap_err();
    assert_eq!(err, LinkError::UndefinedSymbol { name: "triple".into() });
    assert_eq!(session.state(), SessionState::Failed(Stage::Link));
    assert!(session.regions().is_empty());
    assert!(session
        .diagnostics()
        .iter()
        .any(|d| d.stage == Stage::Link && d.message.contains("triple")));

    assert!(matches!(
        session.execute("nine", &[]),
        Err(ExecuteError::NotLoaded { .. })
    ));
    assert!(matches!(
        session.link_and_load(),
        Err(LinkError::InvalidState { .. })
    ));

    registry.register_function("triple", triple as usize).unwrap();
    let object = session.take_object().unwrap();
    let mut retry = Session::new(&registry);
    retry.adopt(object).unwrap();
    retry.link_and_load().unwrap();
    assert_eq!(retry.execute("nine", &[]).unwrap(), Value::Int(9));
}

#[test]
fn test_function_bound_as_data_is_rejected() {
    init_logger();
    let registry = Registry::new(false);
    registry.register_data("triple", &HELLO).unwrap();
    let mut session = Session::new(&registry);
    session
        .compile("long triple(long); long nine(void) { return triple(3); }", &CompileOptions::default())
        .unwrap();

    assert_eq!(
        session.link_and_load().unwrap_err(),
        LinkError::TypeMismatch {
            name: "triple".into(),
            expected: SymbolKind::Function,
            found: SymbolKind::Data,
        }
    );
    assert_eq!(session.state(), SessionState::Failed(Stage::Link));
    assert!(session.regions().is_empty());
}

#[test]
fn test_unload_then_execute() {
    let registry = Registry::default();
    let mut session = Session::new(&registry);
    session
        .compile("int one(void) { return 1; }", &CompileOptions::default())
        .unwrap();
    session.link_and_load().unwrap();
    assert!(!session.regions().is_empty());
    assert_eq!(session.execute("one", &[]).unwrap(), Value::Int(1));

    session.unload().unwrap();
    assert_eq!(session.state(), SessionState::Unloaded);
    assert!(session.regions().is_empty());
    assert_eq!(session.execute("one", &[]), Err(ExecuteError::UseAfterUnload));
    session.unload().unwrap();
}

#[test]
fn test_entry_errors() {
    let registry = Registry::default();
    let mut session = Session::new(&registry);
    session
        .compile("int counter; int twice(int x) { return 2 * x; }", &CompileOptions::default())
        .unwrap();
    session.link_and_load().unwrap();

    assert_eq!(
        session.execute("nope", &[]),
        Err(ExecuteError::EntryNotFound { name: "nope".into() })
    );
    assert_eq!(
        session.execute("counter", &[]),
        Err(ExecuteError::EntryNotFound { name: "counter".into() })
    );
    assert!(matches!(
        session.execute("twice", &[]),
        Err(ExecuteError::TypeMismatch { .. })
    ));
    assert!(matches!(
        session.execute("twice", &[Value::Float(1.0)]),
        Err(ExecuteError::TypeMismatch { .. })
    ));
    assert_eq!(session.state(), SessionState::Loaded);
    assert_eq!(session.execute("twice", &[Value::Int(8)]).unwrap(), Value::Int(16));
}

#[test]
fn test_compile_errors_carry_locations() {
    init_logger();
    let registry = Registry::default();
    let mut session = Session::new(&registry);
    let err = session
        .compile("int f(void) {\n  return 1 + ;\n}", &CompileOptions::default())
        .unwrap_err();

    let diagnostics = err.diagnostics();
    assert!(!diagnostics.is_empty());
    assert_eq!(diagnostics[0].stage, Stage::Parse);
    assert_eq!(diagnostics[0].location.map(|l| l.line), Some(2));
    assert_eq!(session.state(), SessionState::Failed(Stage::Compile));
    assert!(matches!(
        session.compile("int g(void) { return 0; }", &CompileOptions::default()),
        Err(CompileError::InvalidState { .. })
    ));
    assert!(matches!(
        session.take_object(),
        Err(SessionError::InvalidState { .. })
    ));
}

#[test]
fn test_warnings_do_not_fail_compile() {
    let registry = Registry::default();
    let mut session = Session::new(&registry);
    session
        .compile("#include <stdio.h>\nint f(void) { return 3; }", &CompileOptions::default())
        .unwrap();
    let warning = &session.diagnostics()[0];
    assert!(!warning.is_error());
    assert_eq!(warning.location, Some(Location::new(1, 1)));
}

#[test]
fn test_duplicate_registration() {
    let registry = Registry::new(false);
    registry.register_function("add", add as usize).unwrap();
    assert!(matches!(
        registry.register_function("add", triple as usize),
        Err(RegistryError::DuplicateSymbol { .. })
    ));
    assert_eq!(registry.lookup("add").unwrap().address, add as usize);

    let overwriting = Registry::new(true);
    overwriting.register_function("add", add as usize).unwrap();
    overwriting.register_function("add", triple as usize).unwrap();
    assert_eq!(overwriting.lookup("add").unwrap().address, triple as usize);
}

#[test]
fn test_concurrent_sessions_share_registry() {
    let registry = host_registry();
    let results: Vec<i64> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let registry = &registry;
                scope.spawn(move || {
                    let mut session = Session::new(registry);
                    let options = CompileOptions::default().define("OFFSET", n.to_string());
                    session
                        .compile("int add(int, int); int go(void) { return add(OFFSET, 10); }", &options)
                        .unwrap();
                    session.link_and_load().unwrap();
                    session.execute("go", &[]).unwrap().as_i64().unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results, vec![10, 11, 12, 13]);
}

#[test]
fn test_sessions_are_independent() {
    let registry = Registry::default();
    let source = "int counter; int bump(void) { return ++counter; }";
    let mut a = Session::new(&registry);
    let mut b = Session::new(&registry);
    for session in [&mut a, &mut b] {
        session.compile(source, &CompileOptions::default()).unwrap();
        session.link_and_load().unwrap();
    }

    assert_eq!(a.execute("bump", &[]).unwrap(), Value::Int(1));
    assert_eq!(a.execute("bump", &[]).unwrap(), Value::Int(2));
    assert_eq!(b.execute("bump", &[]).unwrap(), Value::Int(1));
    assert_ne!(a.symbol_address("counter"), b.symbol_address("counter"));

    drop(a);
    assert_eq!(b.execute("bump", &[]).unwrap(), Value::Int(2));
}

#[test]
fn test_failed_link_does_not_leak_between_threads() {
    init_logger();
    let registry = Registry::new(false);
    registry.register_function("triple", triple as usize).unwrap();
    let loaded_together = Barrier::new(6);

    let outcomes: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..6)
            .map(|n| {
                let registry = &registry;
                let loaded_together = &loaded_together;
                scope.spawn(move || {
                    let source = if n % 2 == 0 {
                        "long triple(long); long go(void) { return triple(3); }"
                    } else {
                        "long missing(long); long go(void) { return missing(3); }"
                    };
                    let mut session = Session::new(registry);
                    session.compile(source, &CompileOptions::default()).unwrap();
                    let linked = session.link_and_load();
                    let value = linked
                        .as_ref()
                        .ok()
                        .map(|_| session.execute("go", &[]).unwrap());
                    let ranges: Vec<_> = session
                        .regions()
                        .iter()
                        .map(|r| r.base()..r.base() + r.capacity())
                        .collect();
                    let state = session.state();
                    // Every session stays mapped until all ranges are taken.
                    loaded_together.wait();
                    (n, linked, value, session.diagnostics().to_vec(), ranges, state)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut loaded = Vec::new();
    for (n, linked, value, diagnostics, ranges, state) in &outcomes {
        if n % 2 == 0 {
            assert_eq!(*linked, Ok(()));
            assert_eq!(*value, Some(Value::Int(9)));
            assert!(diagnostics.iter().all(|d| d.stage != Stage::Link));
            assert!(!ranges.is_empty());
            assert_eq!(*state, SessionState::Loaded);
            loaded.extend(ranges.iter().cloned());
        } else {
            assert_eq!(*linked, Err(LinkError::UndefinedSymbol { name: "missing".into() }));
            assert!(ranges.is_empty());
            assert!(diagnostics
                .iter()
                .filter(|d| d.stage == Stage::Link)
                .all(|d| d.message.contains("missing") && !d.message.contains("triple")));
            assert_eq!(*state, SessionState::Failed(Stage::Link));
        }
    }

    loaded.sort_by_key(|range| range.start);
    for pair in loaded.windows(2) {
        assert!(pair[0].end <= pair[1].start, "regions overlap: {pair:?}");
    }
    assert!(registry.lookup("missing").is_err());
}

#[test]
fn test_oversized_locals_fail_compile() {
    init_logger();
    let registry = Registry::default();
    for source in [
        "int f(void) { int a[4611686018427387904]; return 0; }",
        "int f(void) { char a[4294967295]; char b[2]; return 0; }",
        "int f(void) { char a[4294967312]; return 0; }",
        "int f(void) {\n  char a[2000000000];\n  char b[2000000000];\n  return a[0] + b[0];\n}",
    ] {
        let mut session = Session::new(&registry);
        let err = session.compile(source, &CompileOptions::default()).unwrap_err();
        let diagnostic = &err.diagnostics()[0];
        assert_eq!(diagnostic.stage, Stage::Compile, "{source}");
        assert!(diagnostic.location.is_some(), "{source}");
        assert!(
            diagnostic.message.contains("too large") || diagnostic.message.contains("stack frame exceeds"),
            "{source}: {}",
            diagnostic.message
        );
        assert_eq!(session.state(), SessionState::Failed(Stage::Compile));
    }
}

#[test]
fn test_deep_nesting_fails_compile() {
    init_logger();
    let registry = Registry::default();
    let mut session = Session::new(&registry);
    let source = format!("int f(int x) {{ return {}x{}; }}", "(".repeat(200), ")".repeat(200));
    let err = session.compile(&source, &CompileOptions::default()).unwrap_err();
    assert_eq!(err.diagnostics()[0].stage, Stage::Parse);
    assert!(err.diagnostics()[0].message.contains("nested too deeply"));
}
