//! Rhai script engine.
//!
//! Script API:
//!
//! - `fn update(dt)` - required, called once per frame with the frame delta
//! - drawing: `clear()`, `set_color(r, g, b)`, `set_color(r, g, b, a)`,
//!   `set_line_width(w)`, `fill_rect(x, y, w, h)`, `stroke_rect(x, y, w, h)`,
//!   `fill_circle(x, y, r)`, `stroke_circle(x, y, r)`, `line(x1, y1, x2, y2)`,
//!   `text(x, y, s)`, `draw_image(name, x, y, w, h)`
//! - input: `key_down(k)`, `key_pressed(k)` (key code or one-character string),
//!   `pointer_x()`, `pointer_y()`, `button_down(n)`, `button_pressed(n)`
//! - timing: `delta()`, `elapsed()`, `frame()`
//! - `print(..)` goes to the log
//!
//! Top-level statements run once at load. Numeric arguments accept ints or floats.

use std::cell::RefCell;
use std::rc::Rc;

use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, ImmutableString, Position, Scope, AST};

use super::script::{FrameInputs, ScriptEngine};
use crate::config::ScriptLimits;
use crate::error::ScriptError;
use crate::types::{DrawInstruction, Key, PointerButtons, Rgba};

const ENTRY_POINT: &str = "update";

type FnResult<T> = Result<T, Box<EvalAltResult>>;

/// State the registered functions read from and write to.
#[derive(Default)]
struct FrameContext {
    inputs: FrameInputs,
    out: Vec<DrawInstruction>,
}

type SharedContext = Rc<RefCell<FrameContext>>;

pub struct RhaiEngine {
    engine: Engine,
    ast: Option<AST>,
    scope: Scope<'static>,
    context: SharedContext,
}

impl RhaiEngine {
    pub fn new(limits: &ScriptLimits) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(limits.max_operations);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(1_000);
        engine.on_print(|text| tracing::info!(target: "frameport::script", "{text}"));

        let context = SharedContext::default();
        register_drawing(&mut engine, &context);
        register_queries(&mut engine, &context);

        Self {
            engine,
            ast: None,
            scope: Scope::new(),
            context,
        }
    }
}

impl ScriptEngine for RhaiEngine {
    fn load(&mut self, source: &str) -> Result<(), ScriptError> {
        let ast = self
            .engine
            .compile(source)
            .map_err(|err| with_position(ScriptError::new(err.to_string()), err.position()))?;

        let has_entry = ast
            .iter_functions()
            .any(|f| f.name == ENTRY_POINT && f.params.len() == 1);
        if !has_entry {
            return Err(ScriptError::new(format!("script does not define `fn {ENTRY_POINT}(dt)`")));
        }

        self.scope = Scope::new();
        self.engine
            .run_ast_with_scope(&mut self.scope, &ast)
            .map_err(|err| script_error(&err))?;
        // Drawing from top-level statements has no frame to land in.
        self.context.borrow_mut().out.clear();

        self.ast = Some(ast);
        Ok(())
    }

    fn run_frame(&mut self, inputs: &FrameInputs, out: &mut Vec<DrawInstruction>) -> Result<(), ScriptError> {
        let Some(ast) = &self.ast else {
            return Err(ScriptError::new("no script loaded"));
        };
        {
            let mut ctx = self.context.borrow_mut();
            ctx.inputs = *inputs;
            ctx.out.clear();
        }

        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let result = self.engine.call_fn_with_options::<Dynamic>(
            options,
            &mut self.scope,
            ast,
            ENTRY_POINT,
            (inputs.timing.delta,),
        );

        let produced = std::mem::take(&mut self.context.borrow_mut().out);
        match result {
            Ok(_) => {
                out.extend(produced);
                Ok(())
            }
            Err(err) => Err(script_error(&err)),
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

fn with_position(error: ScriptError, position: Position) -> ScriptError {
    if position.is_none() {
        error
    } else {
        error.with_trace(position.to_string())
    }
}

/// Flatten nested function-call errors into a message plus a call trace.
fn script_error(err: &EvalAltResult) -> ScriptError {
    let mut frames = Vec::new();
    let mut current = err;
    while let EvalAltResult::ErrorInFunctionCall(name, _, inner, pos) = current {
        frames.push(format!("in {name} @ {pos}"));
        current = inner.as_ref();
    }

    let message = match current {
        EvalAltResult::ErrorRuntime(value, _) => value.to_string(),
        other => other.to_string(),
    };
    let position = current.position();
    if !position.is_none() {
        frames.insert(0, format!("at {position}"));
    }

    let error = ScriptError::new(message);
    if frames.is_empty() {
        error
    } else {
        error.with_trace(frames.join("\n"))
    }
}

fn number(value: &Dynamic, function: &str) -> FnResult<f32> {
    if let Ok(f) = value.as_float() {
        Ok(f as f32)
    } else if let Ok(i) = value.as_int() {
        Ok(i as f32)
    } else {
        Err(format!("{function} expects numbers, got {}", value.type_name()).into())
    }
}

fn channel(value: &Dynamic, function: &str) -> FnResult<u8> {
    Ok(number(value, function)?.clamp(0.0, 255.0) as u8)
}

// =============================================================================
// API REGISTRATION
// =============================================================================

fn register_drawing(engine: &mut Engine, context: &SharedContext) {
    let ctx = context.clone();
    engine.register_fn("clear", move || {
        ctx.borrow_mut().out.push(DrawInstruction::Clear);
    });

    let ctx = context.clone();
    engine.register_fn("set_color", move |r: Dynamic, g: Dynamic, b: Dynamic| -> FnResult<()> {
        let color = Rgba::rgb(channel(&r, "set_color")?, channel(&g, "set_color")?, channel(&b, "set_color")?);
        ctx.borrow_mut().out.push(DrawInstruction::SetColor { color });
        Ok(())
    });

    let ctx = context.clone();
    engine.register_fn(
        "set_color",
        move |r: Dynamic, g: Dynamic, b: Dynamic, a: Dynamic| -> FnResult<()> {
            let color = Rgba::new(
                channel(&r, "set_color")?,
                channel(&g, "set_color")?,
                channel(&b, "set_color")?,
                channel(&a, "set_color")?,
            );
            ctx.borrow_mut().out.push(DrawInstruction::SetColor { color });
            Ok(())
        },
    );

    let ctx = context.clone();
    engine.register_fn("set_line_width", move |width: Dynamic| -> FnResult<()> {
        let width = number(&width, "set_line_width")?;
        ctx.borrow_mut().out.push(DrawInstruction::SetLineWidth { width });
        Ok(())
    });

    let ctx = context.clone();
    engine.register_fn(
        "fill_rect",
        move |x: Dynamic, y: Dynamic, w: Dynamic, h: Dynamic| -> FnResult<()> {
            let f = "fill_rect";
            let instruction = DrawInstruction::FillRect {
                x: number(&x, f)?,
                y: number(&y, f)?,
                width: number(&w, f)?,
                height: number(&h, f)?,
            };
            ctx.borrow_mut().out.push(instruction);
            Ok(())
        },
    );

    let ctx = context.clone();
    engine.register_fn(
        "stroke_rect",
        move |x: Dynamic, y: Dynamic, w: Dynamic, h: Dynamic| -> FnResult<()> {
            let f = "stroke_rect";
            let instruction = DrawInstruction::StrokeRect {
                x: number(&x, f)?,
                y: number(&y, f)?,
                width: number(&w, f)?,
                height: number(&h, f)?,
            };
            ctx.borrow_mut().out.push(instruction);
            Ok(())
        },
    );

    let ctx = context.clone();
    engine.register_fn("fill_circle", move |x: Dynamic, y: Dynamic, r: Dynamic| -> FnResult<()> {
        let f = "fill_circle";
        let instruction = DrawInstruction::FillCircle {
            x: number(&x, f)?,
            y: number(&y, f)?,
            radius: number(&r, f)?,
        };
        ctx.borrow_mut().out.push(instruction);
        Ok(())
    });

    let ctx = context.clone();
    engine.register_fn("stroke_circle", move |x: Dynamic, y: Dynamic, r: Dynamic| -> FnResult<()> {
        let f = "stroke_circle";
        let instruction = DrawInstruction::StrokeCircle {
            x: number(&x, f)?,
            y: number(&y, f)?,
            radius: number(&r, f)?,
        };
        ctx.borrow_mut().out.push(instruction);
        Ok(())
    });

    let ctx = context.clone();
    engine.register_fn(
        "line",
        move |x1: Dynamic, y1: Dynamic, x2: Dynamic, y2: Dynamic| -> FnResult<()> {
            let f = "line";
            let instruction = DrawInstruction::Line {
                x1: number(&x1, f)?,
                y1: number(&y1, f)?,
                x2: number(&x2, f)?,
                y2: number(&y2, f)?,
            };
            ctx.borrow_mut().out.push(instruction);
            Ok(())
        },
    );

    let ctx = context.clone();
    engine.register_fn("text", move |x: Dynamic, y: Dynamic, text: Dynamic| -> FnResult<()> {
        let instruction = DrawInstruction::Text {
            x: number(&x, "text")?,
            y: number(&y, "text")?,
            text: text.to_string(),
        };
        ctx.borrow_mut().out.push(instruction);
        Ok(())
    });

    let ctx = context.clone();
    engine.register_fn(
        "draw_image",
        move |image: ImmutableString, x: Dynamic, y: Dynamic, w: Dynamic, h: Dynamic| -> FnResult<()> {
            let f = "draw_image";
            let instruction = DrawInstruction::DrawImage {
                image: image.to_string(),
                x: number(&x, f)?,
                y: number(&y, f)?,
                width: number(&w, f)?,
                height: number(&h, f)?,
            };
            ctx.borrow_mut().out.push(instruction);
            Ok(())
        },
    );
}

fn key_from_code(code: i64) -> FnResult<Key> {
    u8::try_from(code)
        .map(Key)
        .map_err(|_| format!("key code {code} out of range").into())
}

fn key_from_str(name: &str) -> FnResult<Key> {
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Key::from_char(c).ok_or_else(|| format!("unsupported key `{name}`").into()),
        _ => Err(format!("unsupported key `{name}`").into()),
    }
}

fn button_bits(button: i64) -> PointerButtons {
    match button {
        0..=31 => PointerButtons::from_bits_truncate(1 << button),
        _ => PointerButtons::empty(),
    }
}

fn register_queries(engine: &mut Engine, context: &SharedContext) {
    let ctx = context.clone();
    engine.register_fn("key_down", move |code: i64| -> FnResult<bool> {
        Ok(ctx.borrow().inputs.input.keys_down.contains(key_from_code(code)?))
    });
    let ctx = context.clone();
    engine.register_fn("key_down", move |name: ImmutableString| -> FnResult<bool> {
        Ok(ctx.borrow().inputs.input.keys_down.contains(key_from_str(&name)?))
    });
    let ctx = context.clone();
    engine.register_fn("key_pressed", move |code: i64| -> FnResult<bool> {
        Ok(ctx.borrow().inputs.input.keys_pressed.contains(key_from_code(code)?))
    });
    let ctx = context.clone();
    engine.register_fn("key_pressed", move |name: ImmutableString| -> FnResult<bool> {
        Ok(ctx.borrow().inputs.input.keys_pressed.contains(key_from_str(&name)?))
    });

    let ctx = context.clone();
    engine.register_fn("pointer_x", move || ctx.borrow().inputs.input.pointer_x as f64);
    let ctx = context.clone();
    engine.register_fn("pointer_y", move || ctx.borrow().inputs.input.pointer_y as f64);
    let ctx = context.clone();
    engine.register_fn("button_down", move |button: i64| {
        let bits = button_bits(button);
        !bits.is_empty() && ctx.borrow().inputs.input.buttons_down.contains(bits)
    });
    let ctx = context.clone();
    engine.register_fn("button_pressed", move |button: i64| {
        let bits = button_bits(button);
        !bits.is_empty() && ctx.borrow().inputs.input.buttons_pressed.contains(bits)
    });

    let ctx = context.clone();
    engine.register_fn("delta", move || ctx.borrow().inputs.timing.delta);
    let ctx = context.clone();
    engine.register_fn("elapsed", move || ctx.borrow().inputs.timing.elapsed);
    let ctx = context.clone();
    engine.register_fn("frame", move || ctx.borrow().inputs.timing.frame as i64);
}

// =============================================================================
// TESTS
// =============================================================================
