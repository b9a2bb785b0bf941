use std::cell::RefCell;
use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::rc::Rc;
use std::sync::Arc;

use ribose::prelude::*;
use ribose::util::test_helpers::AutomatonBuilder;

/// Model file that cleans up after itself.
struct TempModel(PathBuf);

impl Drop for TempModel {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn compile_with<T: Target>(
    tag: &str,
    target: &mut T,
    automata: &[(&str, Vec<u8>)],
    tune: impl FnOnce(&mut ModelCompiler),
) -> (TempModel, Arc<Model>) {
    let mut compiler = ModelCompiler::new(target);
    tune(&mut compiler);
    for (name, text) in automata {
        compiler.compile(name, text);
    }
    let path = env::temp_dir().join(format!("ribose-{tag}-{}.model", process::id()));
    compiler.save(&path).expect("model saves");
    let model = Model::load(&path).expect("model loads");
    (TempModel(path), model)
}

fn compile(
    tag: &str,
    automata: &[(&str, Vec<u8>)],
    tune: impl FnOnce(&mut ModelCompiler),
) -> (TempModel, Arc<Model>) {
    let mut target = BaseTarget;
    compile_with(tag, &mut target, automata, tune)
}

/// Output sink whose captured bytes stay inspectable from the test.
#[derive(Clone, Default)]
struct SharedSink(Rc<RefCell<Vec<u8>>>);

impl SharedSink {
    fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// State 0 self-loops silently on 0x00..=0xFE and pops on 0xFF. The
/// assembler collapses the self-loop into a single `mscan`.
#[test]
fn minimal_scan_consumes_with_one_activation() {
    let scan = AutomatonBuilder::new()
        .byte_range(0, 0, 0x00..=0xfe)
        .byte(0, 2, 0xff)
        .effect(2, 4, b"stop")
        .fin(4)
        .build();
    let (_file, model) = compile("scan", &[("scan", scan)], |_| {});

    let mut t = model.transductor(BaseTarget).expect("binds");
    t.start("scan").expect("starts");
    t.push(vec![0x41, 0x41, 0xff]).expect("pushes");

    assert_eq!(t.run().expect("runs"), Status::Stopped);
    assert_eq!(t.metrics().bytes, 3);
    assert_eq!(t.metrics().scan, 1, "exactly one mscan activation");
    assert_eq!(t.metrics().errors, 0);
}

fn product_automaton() -> Vec<u8> {
    AutomatonBuilder::new()
        .byte(0, 2, b'a')
        .byte(2, 4, b'b')
        .byte(4, 6, b'c')
        .symbol(6, 8, b"!eos")
        .effect(8, 10, b"stop")
        .fin(10)
        .build()
}

/// A chain of single-byte states collapses into one `mproduct` edge.
#[test]
fn product_chain_matches_verbatim() {
    let (_file, model) = compile("product", &[("chain", product_automaton())], |c| {
        c.assembler.min_product_length = 2;
    });

    let mut t = model.transductor(BaseTarget).expect("binds");
    t.start("chain").expect("starts");
    t.push(b"abc".to_vec()).expect("pushes");
    assert_eq!(t.run().expect("runs"), Status::Waiting);
    assert_eq!(t.metrics().product, 1);

    t.signal(SIGNAL_EOS).expect("signals");
    assert_eq!(t.run().expect("runs"), Status::Stopped);
    assert_eq!(t.metrics().bytes, 4);
    assert_eq!(t.metrics().errors, 0);
}

/// Superinstruction injection must not change what a transduction
/// observes: status, consumed input and error accounting agree whether or
/// not the product was collapsed.
#[test]
fn product_injection_is_transparent() {
    let outcomes: Vec<_> = [2usize, 99]
        .iter()
        .map(|min| {
            let tag = format!("transparent{min}");
            let (_file, model) = compile(&tag, &[("chain", product_automaton())], |c| {
                c.assembler.min_product_length = *min;
            });
            let mut t = model.transductor(BaseTarget).expect("binds");
            t.start("chain").expect("starts");
            t.push(b"aXc".to_vec()).expect("pushes");
            let result = t.run();
            assert!(matches!(result, Err(RunError::Domain { .. })));
            let metrics = t.metrics();
            (
                metrics.bytes,
                metrics.traps,
                metrics.errors,
                t.input_remaining(),
            )
        })
        .collect();
    assert_eq!(outcomes[0], outcomes[1]);
    // the offending byte is consumed, the byte after it is not
    assert_eq!(outcomes[0].3, 1);
}

/// Mark, advance across a nested frame, reset: the replayed bytes are
/// transduced again and nested injections re-fire.
#[test]
fn mark_replays_across_frames() {
    let marker = AutomatonBuilder::new()
        .byte_range(0, 2, b'A'..=b'Z')
        .effect(2, 0, b"paste")
        .byte(0, 4, b'<')
        .effect(4, 6, b"in")
        .param(6, 0, b"X")
        .symbol(0, 8, b"!nil")
        .effect(8, 0, b"mark")
        .symbol(0, 10, b"!eol")
        .effect(10, 0, b"reset")
        .symbol(0, 12, b"!eos")
        .effect(12, 14, b"stop")
        .fin(14)
        .build();
    let (_file, model) = compile("marker", &[("marker", marker)], |_| {});

    let mut t = model.transductor(BaseTarget).expect("binds");
    t.start("marker").expect("starts");

    t.push(b"A".to_vec()).expect("pushes");
    assert_eq!(t.run().expect("runs"), Status::Waiting);

    t.signal(SIGNAL_NIL).expect("signals");
    assert_eq!(t.run().expect("runs"), Status::Waiting);

    t.push(b"B<C".to_vec()).expect("pushes");
    assert_eq!(t.run().expect("runs"), Status::Waiting);
    assert_eq!(t.field(b""), Some(&b"ABXC"[..]));

    t.signal(SIGNAL_EOL).expect("signals");
    assert_eq!(t.run().expect("runs"), Status::Waiting);
    assert_eq!(t.field(b""), Some(&b"ABXCBXC"[..]));

    t.signal(SIGNAL_EOS).expect("signals");
    assert_eq!(t.run().expect("runs"), Status::Stopped);
}

/// A rejected byte injects `nul`; a transducer with a `nul` handler pops
/// itself and `run` reports a clean stop.
#[test]
fn domain_error_recovers_through_nul_handler() {
    let recover = AutomatonBuilder::new()
        .byte(0, 2, b'a')
        .effect(2, 0, b"paste")
        .symbol(0, 4, b"!nul")
        .effect(4, 6, b"stop")
        .fin(6)
        .build();
    let (_file, model) = compile("recover", &[("recover", recover)], |_| {});

    let mut t = model.transductor(BaseTarget).expect("binds");
    t.start("recover").expect("starts");
    t.push(b"z".to_vec()).expect("pushes");

    assert_eq!(t.run().expect("recovers"), Status::Stopped);
    assert_eq!(t.metrics().traps, 1);
    assert_eq!(t.metrics().errors, 0);
}

/// Without a `nul` handler the injected signal cascades into a fatal
/// domain error, with the offending byte consumed and the rest intact.
#[test]
fn nul_cascade_is_fatal() {
    let strict = AutomatonBuilder::new()
        .byte(0, 2, b'a')
        .effect(2, 0, b"paste")
        .build();
    let (_file, model) = compile("strict", &[("strict", strict)], |_| {});

    let mut t = model.transductor(BaseTarget).expect("binds");
    t.start("strict").expect("starts");
    t.push(b"zq".to_vec()).expect("pushes");

    let error = t.run().expect_err("cascade is fatal");
    assert!(matches!(error, RunError::Domain { .. }));
    // past the offending byte, before the subsequent one
    assert_eq!(t.input_remaining(), 1);
}

/// select/copy/out plumbing: accumulate into two named fields and emit
/// them interleaved with a literal.
#[test]
fn fields_select_and_out() {
    let fields = AutomatonBuilder::new()
        .byte_range(0, 2, b'a'..=b'z')
        .effect(2, 0, b"paste")
        .byte(0, 4, b'1')
        .effect(4, 6, b"select")
        .param(6, 0, b"~left")
        .byte(0, 8, b'2')
        .effect(8, 10, b"select")
        .param(10, 0, b"~right")
        .byte(0, 12, b'!')
        .effect(12, 14, b"out")
        .param(14, 16, b"~left")
        .param(16, 18, b"-")
        .param(18, 0, b"~right")
        .symbol(0, 20, b"!eos")
        .effect(20, 22, b"stop")
        .fin(22)
        .build();
    let (_file, model) = compile("fields", &[("fields", fields)], |_| {});

    let mut t = model.transductor(BaseTarget).expect("binds");
    let sink = SharedSink::default();
    t.output(sink.clone());
    t.start("fields").expect("starts");
    t.push(b"1ab2cd!".to_vec()).expect("pushes");
    assert_eq!(t.run().expect("runs"), Status::Waiting);

    t.signal(SIGNAL_EOS).expect("signals");
    assert_eq!(t.run().expect("runs"), Status::Stopped);
    assert_eq!(sink.contents(), b"ab-cd");
    assert_eq!(t.field(b"left"), Some(&b"ab"[..]));
    assert_eq!(t.field(b"right"), Some(&b"cd"[..]));
}

/// An armed countdown decrements per `count` invocation and raises its
/// signal at zero.
#[test]
fn countdown_signals_at_zero() {
    let counter = AutomatonBuilder::new()
        .byte(0, 2, b'+')
        .effect(2, 4, b"count")
        .param(4, 6, b"3")
        .param(6, 0, b"!eol")
        .byte(0, 8, b'x')
        .effect(8, 0, b"count")
        .symbol(0, 10, b"!eol")
        .effect(10, 12, b"stop")
        .fin(12)
        .build();
    let (_file, model) = compile("count", &[("counter", counter)], |_| {});

    let mut t = model.transductor(BaseTarget).expect("binds");
    t.start("counter").expect("starts");
    t.push(b"+xxxY".to_vec()).expect("pushes");

    assert_eq!(t.run().expect("runs"), Status::Stopped);
    // the countdown signal interrupted before Y was read
    assert_eq!(t.input_remaining(), 1);
    // the injected signal frame needed one fresh buffer
    assert_eq!(t.metrics().allocated, 1);
}

/// A self-reinjecting `in` chain grows the input stack until the depth
/// guard fails the transduction.
#[test]
fn runaway_input_injection_overflows() {
    let runaway = AutomatonBuilder::new()
        .byte(0, 2, b'r')
        .effect(2, 4, b"in")
        .param(4, 0, b"r")
        .build();
    let (_file, model) = compile("runaway", &[("runaway", runaway)], |_| {});

    let mut t = model.transductor(BaseTarget).expect("binds");
    t.start("runaway").expect("starts");
    t.push(b"r".to_vec()).expect("pushes");

    let error = t.run().expect_err("guard must trip");
    assert!(matches!(error, RunError::InputOverflow(_)));
}

/// One transducer starts another; the callee pops back to the caller.
#[test]
fn start_pushes_a_nested_transducer() {
    let outer = AutomatonBuilder::new()
        .byte(0, 2, b'[')
        .effect(2, 4, b"start")
        .param(4, 0, b"@inner")
        .byte(0, 6, b'.')
        .effect(6, 0, b"paste")
        .symbol(0, 8, b"!eos")
        .effect(8, 10, b"stop")
        .fin(10)
        .build();
    let inner = AutomatonBuilder::new()
        .byte(0, 2, b'i')
        .effect(2, 0, b"paste")
        .byte(0, 4, b']')
        .effect(4, 6, b"stop")
        .fin(6)
        .build();
    let (_file, model) = compile(
        "nested",
        &[("outer", outer), ("inner", inner)],
        |_| {},
    );

    let mut t = model.transductor(BaseTarget).expect("binds");
    t.start("outer").expect("starts");
    t.push(b"[ii].".to_vec()).expect("pushes");
    assert_eq!(t.run().expect("runs"), Status::Waiting);
    assert_eq!(t.field(b""), Some(&b"ii."[..]));

    t.signal(SIGNAL_EOS).expect("signals");
    assert_eq!(t.run().expect("runs"), Status::Stopped);
}

/// An effector-requested pause suspends the run loop; the next `run`
/// resumes where it left off.
#[test]
fn pause_suspends_and_resumes() {
    let pausing = AutomatonBuilder::new()
        .byte(0, 2, b'a')
        .effect(2, 0, b"paste")
        .byte(0, 4, b';')
        .effect(4, 0, b"pause")
        .symbol(0, 6, b"!eos")
        .effect(6, 8, b"stop")
        .fin(8)
        .build();
    let (_file, model) = compile("pause", &[("pausing", pausing)], |_| {});

    let mut t = model.transductor(BaseTarget).expect("binds");
    t.start("pausing").expect("starts");
    t.push(b"a;a".to_vec()).expect("pushes");

    assert_eq!(t.run().expect("runs"), Status::Paused);
    assert_eq!(t.field(b""), Some(&b"a"[..]));

    assert_eq!(t.run().expect("resumes"), Status::Waiting);
    assert_eq!(t.field(b""), Some(&b"aa"[..]));

    t.signal(SIGNAL_EOS).expect("signals");
    assert_eq!(t.run().expect("stops"), Status::Stopped);
}

/* host effectors */

#[derive(Debug, Default)]
struct Gadget {
    notes: Vec<Vec<u8>>,
}

impl Target for Gadget {
    fn name(&self) -> &str {
        "Gadget"
    }

    fn effectors(&mut self) -> Vec<Box<dyn Effector<Self>>> {
        vec![Box::new(NoteEffector::default())]
    }
}

#[derive(Debug, Default)]
struct NoteEffector {
    params: Vec<Vec<u8>>,
}

impl Effector<Gadget> for NoteEffector {
    fn name(&self) -> &[u8] {
        b"note"
    }

    fn invoke(
        &mut self,
        target: &mut Gadget,
        ctx: &mut EffectorContext<'_>,
    ) -> Result<Effect, EffectorError> {
        target.notes.push(vec![(ctx.symbol() & 0xff) as u8]);
        Ok(EFFECT_NONE)
    }

    fn allocate_parameters(&mut self, parameters: usize) {
        self.params.reserve(parameters);
    }

    fn compile_parameter(
        &mut self,
        _ordinal: usize,
        tokens: &[ribose::token::Token],
    ) -> Result<(), EffectorError> {
        match tokens {
            [token] => {
                self.params.push(token.symbol().to_vec());
                Ok(())
            }
            _ => Err(EffectorError::BadParameter {
                effector: "note".to_owned(),
                reason: "expected one token".to_owned(),
            }),
        }
    }

    fn invoke_parameterised(
        &mut self,
        target: &mut Gadget,
        _ctx: &mut EffectorContext<'_>,
        parameter: usize,
    ) -> Result<Effect, EffectorError> {
        target.notes.push(self.params[parameter].clone());
        Ok(EFFECT_NONE)
    }
}

/// A host effector rides after the built-in prefix, with parameters
/// compiled through its own callback.
#[test]
fn host_effector_binds_and_invokes() {
    let noted = AutomatonBuilder::new()
        .byte(0, 2, b'n')
        .effect(2, 4, b"note")
        .param(4, 0, b"hello")
        .byte(0, 6, b'm')
        .effect(6, 0, b"note")
        .symbol(0, 8, b"!eos")
        .effect(8, 10, b"stop")
        .fin(10)
        .build();
    let mut target = Gadget::default();
    let (_file, model) = compile_with("host", &mut target, &[("noted", noted)], |_| {});

    let mut t = model.transductor(Gadget::default()).expect("binds");
    t.start("noted").expect("starts");
    t.push(b"nm".to_vec()).expect("pushes");
    assert_eq!(t.run().expect("runs"), Status::Waiting);

    t.signal(SIGNAL_EOS).expect("signals");
    assert_eq!(t.run().expect("runs"), Status::Stopped);
    let target = t.into_target();
    assert_eq!(target.notes, vec![b"hello".to_vec(), b"m".to_vec()]);
}
