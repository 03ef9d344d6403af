//! End-to-end tests: compile C source, load it and call into it.

use std::ffi::{CStr, CString};

use cscript::{CompileOptions, Registry, Session, Value};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Compile and load `source` against an empty registry.
fn load<'r>(registry: &'r Registry, source: &str) -> Session<'r> {
    init_logger();
    let mut session = Session::new(registry);
    session
        .compile(source, &CompileOptions::default())
        .unwrap_or_else(|e| panic!("compile failed: {e}"));
    session.link_and_load().unwrap();
    session
}

fn run(source: &str, entry: &str, args: &[Value]) -> Value {
    let registry = Registry::default();
    let mut session = load(&registry, source);
    session.execute(entry, args).unwrap()
}

#[test]
fn test_recursive_fibonacci() {
    let source = "int fib(int n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }";
    assert_eq!(run(source, "fib", &[Value::Int(10)]), Value::Int(55));
    assert_eq!(run(source, "fib", &[Value::Int(20)]), Value::Int(6765));
}

#[test]
fn test_integer_arithmetic() {
    let source = "
        int divmod(int a, int b) { return (a / b) * 100 + a % b; }
        long shifts(long x) { return (x << 4) >> 2; }
        unsigned long high_nibble(unsigned long x) { return x >> 60; }
        unsigned int wrap(void) { unsigned int x = 0; return x - 1; }
        int bits(int a, int b) { return (a & b) | (a ^ b) << 8; }
        int max(int a, int b) { return a > b ? a : b; }
    ";
    let registry = Registry::default();
    let mut session = load(&registry, source);

    assert_eq!(session.execute("divmod", &[Value::Int(-7), Value::Int(2)]).unwrap(), Value::Int(-301));
    assert_eq!(session.execute("shifts", &[Value::Int(3)]).unwrap(), Value::Int(12));
    assert_eq!(session.execute("high_nibble", &[Value::Int(-1)]).unwrap(), Value::Int(15));
    assert_eq!(session.execute("wrap", &[]).unwrap(), Value::Int(u32::MAX as i64));
    assert_eq!(session.execute("bits", &[Value::Int(12), Value::Int(10)]).unwrap(), Value::Int(8 | (6 << 8)));
    assert_eq!(session.execute("max", &[Value::Int(-3), Value::Int(-9)]).unwrap(), Value::Int(-3));
}

#[test]
fn test_doubles_and_conversions() {
    let source = "
        double average(double a, double b) { return (a + b) / 2.0; }
        double scale(double x, int n) { return x * n; }
        int truncate(double x) { return (int)x; }
        int less(double a, double b) { return a < b; }
        double mix(int a, double x, long b, double y, int c, int d) { return a + x + b + y + c + d; }
    ";
    let registry = Registry::default();
    let mut session = load(&registry, source);

    assert_eq!(session.execute("average", &[Value::Float(1.0), Value::Float(4.0)]).unwrap(), Value::Float(2.5));
    assert_eq!(session.execute("scale", &[Value::Float(1.5), Value::Int(4)]).unwrap(), Value::Float(6.0));
    assert_eq!(session.execute("truncate", &[Value::Float(-2.7)]).unwrap(), Value::Int(-2));
    assert_eq!(session.execute("less", &[Value::Float(1.0), Value::Float(2.0)]).unwrap(), Value::Int(1));
    assert_eq!(session.execute("less", &[Value::Float(2.0), Value::Float(1.0)]).unwrap(), Value::Int(0));

    let args = [
        Value::Int(1),
        Value::Float(0.5),
        Value::Int(2),
        Value::Float(0.25),
        Value::Int(3),
        Value::Int(4),
    ];
    assert_eq!(session.execute("mix", &args).unwrap(), Value::Float(10.75));
}

#[test]
fn test_loops_and_control_flow() {
    let source = "
        long sum_to(int n) { long total = 0; for (int i = 1; i <= n; i++) total += i; return total; }
        int collatz(long n) {
            int steps = 0;
            while (1) {
                if (n == 1) break;
                if (n % 2 == 0) { n = n / 2; steps++; continue; }
                n = 3 * n + 1;
                steps++;
            }
            return steps;
        }
        int digits(long n) { int count = 0; do { count++; n /= 10; } while (n != 0); return count; }
    ";
    let registry = Registry::default();
    let mut session = load(&registry, source);

    assert_eq!(session.execute("sum_to", &[Value::Int(100)]).unwrap(), Value::Int(5050));
    assert_eq!(session.execute("collatz", &[Value::Int(6)]).unwrap(), Value::Int(8));
    assert_eq!(session.execute("digits", &[Value::Int(0)]).unwrap(), Value::Int(1));
    assert_eq!(session.execute("digits", &[Value::Int(12345)]).unwrap(), Value::Int(5));
}

#[test]
fn test_arrays_and_pointers() {
    let source = "
        int squares(int n) {
            int buf[10];
            int i;
            int total = 0;
            for (i = 0; i < n; i++) buf[i] = i * i;
            for (i = 0; i < n; i++) total += buf[i];
            return total;
        }
        int sum_bytes(const char *s) { int total = 0; while (*s) total += *s++; return total; }
        int guard(int *p) { return p && *p > 3; }
    ";
    let registry = Registry::default();
    let mut session = load(&registry, source);

    assert_eq!(session.execute("squares", &[Value::Int(4)]).unwrap(), Value::Int(14));

    let text = CString::new("abc").unwrap();
    assert_eq!(
        session.execute("sum_bytes", &[Value::from(text.as_ptr())]).unwrap(),
        Value::Int(294)
    );

    let five = 5i32;
    assert_eq!(session.execute("guard", &[Value::Ptr(0)]).unwrap(), Value::Int(0));
    assert_eq!(
        session.execute("guard", &[Value::from(&five as *const i32)]).unwrap(),
        Value::Int(1)
    );
}

#[test]
fn test_globals_persist_between_calls() {
    let source = "
        int counter;
        int value = 7;
        int bump(void) { return ++counter; }
        int next_id(void) { static int id = 100; return id++; }
        int *where(void) { return &value; }
    ";
    let registry = Registry::default();
    let mut session = load(&registry, source);

    for expected in 1..=3 {
        assert_eq!(session.execute("bump", &[]).unwrap(), Value::Int(expected));
    }
    assert_eq!(session.execute("next_id", &[]).unwrap(), Value::Int(100));
    assert_eq!(session.execute("next_id", &[]).unwrap(), Value::Int(101));

    let address = session.execute("where", &[]).unwrap().as_ptr().unwrap();
    assert_eq!(Some(address), session.symbol_address("value"));
    // SAFETY: `value` lives in the session's loaded data region.
    assert_eq!(unsafe { *(address as *const i32) }, 7);
    assert_eq!(session.stats().executions, 6);
}

#[test]
fn test_string_literals_and_function_pointers() {
    let source = "
        const char *greet(void) { return \"hello\"; }
        static int twice(int x) { return 2 * x; }
        int apply(int (*f)(int), int x) { return f(x); }
        int run(void) { return apply(twice, 21); }
    ";
    let registry = Registry::default();
    let mut session = load(&registry, source);

    let address = session.execute("greet", &[]).unwrap().as_ptr().unwrap();
    // SAFETY: the literal is NUL-terminated in the loaded read-only region.
    let greeting = unsafe { CStr::from_ptr(address as *const std::ffi::c_char) };
    assert_eq!(greeting.to_str().unwrap(), "hello");

    assert_eq!(session.execute("run", &[]).unwrap(), Value::Int(42));
    assert!(session.symbol_address("twice").is_none());
}

#[test]
fn test_void_function() {
    let source = "
        int total;
        void add_to(int x) { total += x; }
        int get(void) { return total; }
    ";
    let registry = Registry::default();
    let mut session = load(&registry, source);

    assert!(session.execute("add_to", &[Value::Int(4)]).unwrap().is_void());
    assert!(session.execute("add_to", &[Value::Int(5)]).unwrap().is_void());
    assert_eq!(session.execute("get", &[]).unwrap(), Value::Int(9));
}

#[test]
fn test_defines_select_code() {
    let source = "
        #ifdef FAST
        int mode(void) { return SPEED; }
        #else
        int mode(void) { return 0; }
        #endif
    ";
    let registry = Registry::default();
    let mut session = Session::new(&registry);
    let options = CompileOptions::default().define("FAST", "1").define("SPEED", "3");
    session.compile(source, &options).unwrap();
    session.link_and_load().unwrap();
    assert_eq!(session.execute("mode", &[]).unwrap(), Value::Int(3));

    assert_eq!(run(source, "mode", &[]), Value::Int(0));
}
