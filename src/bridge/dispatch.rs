/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Typed call dispatch for imported native functions.
//!
//! Import tables are per worker thread: two workers may import
//! functions with identical names from different libraries and each
//! calls its own. The dispatcher enumerates a closed set of call
//! shapes (one letter per marshalled argument kind) and transmutes
//! the resolved symbol to the matching C function type. Signatures
//! outside the set fail at import time with `UnsupportedSignature`.
//!
//! `table` arguments cross the boundary as serialised blobs minted by
//! the managed store so their address stays stable for the callee;
//! `table` returns are decoded from the returned address.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::sync::Arc;

use mlua::{LightUserData, Lua, MultiValue, Value as LuaValue};
use tracing::trace;

use crate::bridge::library::LoadedLibrary;
use crate::bridge::managed;
use crate::bridge::signature::{CType, Signature};
use crate::common::error::AgentError;
use crate::message::codec;
use crate::script::convert;

/// One entry of a worker thread's import table.
#[derive(Clone)]
pub(crate) struct ImportedFunction {
    /// Keeps the library mapped while the import is live.
    pub library: Arc<LoadedLibrary>,
    /// The resolved symbol as a raw code pointer.
    pub symbol: *const (),
    /// The parsed signature the symbol was imported with.
    pub signature: Signature,
}

thread_local! {
    static IMPORTS: RefCell<HashMap<String, ImportedFunction>> = RefCell::new(HashMap::new());
}

/// Whether `name` is already imported on this worker thread.
pub(crate) fn is_imported(name: &str) -> bool {
    IMPORTS.with(|imports| imports.borrow().contains_key(name))
}

/// Records an import on this worker thread.
pub(crate) fn store_imported(name: &str, function: ImportedFunction) {
    IMPORTS.with(|imports| {
        imports.borrow_mut().insert(name.to_string(), function);
    });
}

/// Number of imports live on this worker thread.
pub fn imported_count() -> usize {
    IMPORTS.with(|imports| imports.borrow().len())
}

/// Clears this worker thread's import table, dropping its library
/// references; libraries with no remaining references unload.
pub fn reset_imported() {
    IMPORTS.with(|imports| imports.borrow_mut().clear());
}

/// The argument-kind letters of a marshalled call, e.g. `"II"` for two
/// integers. Tables marshal as pointers (`P`).
fn shape_of(params: &[CType]) -> String {
    params
        .iter()
        .map(|param| match param {
            CType::LongLong => 'I',
            CType::Double => 'F',
            CType::Bool => 'B',
            CType::ConstCharPtr => 'S',
            CType::VoidPtr | CType::Table => 'P',
            CType::Void => 'V',
        })
        .collect()
}

/// The closed set of supported argument shapes.
const SUPPORTED_SHAPES: &[&str] = &[
    "", "I", "II", "III", "IIII", "F", "FF", "FFF", "IF", "FI", "B", "IB", "S", "SS", "SI", "IS",
    "P", "PI", "PII", "PP", "PF", "PS",
];

/// Validates that a parsed signature maps to a dispatchable shape.
pub(crate) fn validate_shape(signature: &Signature) -> Result<(), AgentError> {
    let shape = shape_of(&signature.params);
    if SUPPORTED_SHAPES.contains(&shape.as_str()) {
        Ok(())
    } else {
        Err(AgentError::UnsupportedSignature(format!(
            "{}: this argument combination is not in the supported set",
            signature.canonical()
        )))
    }
}

enum CArg {
    I(i64),
    F(f64),
    B(bool),
    S(CString),
    P(*mut c_void),
}

struct ArgPack(Vec<CArg>);

impl ArgPack {
    fn i(&self, n: usize) -> i64 {
        match &self.0[n] {
            CArg::I(value) => *value,
            _ => unreachable!("argument {n} marshalled as non-integer"),
        }
    }

    fn f(&self, n: usize) -> f64 {
        match &self.0[n] {
            CArg::F(value) => *value,
            _ => unreachable!("argument {n} marshalled as non-double"),
        }
    }

    fn b(&self, n: usize) -> bool {
        match &self.0[n] {
            CArg::B(value) => *value,
            _ => unreachable!("argument {n} marshalled as non-bool"),
        }
    }

    fn s(&self, n: usize) -> *const c_char {
        match &self.0[n] {
            CArg::S(value) => value.as_ptr(),
            _ => unreachable!("argument {n} marshalled as non-string"),
        }
    }

    fn p(&self, n: usize) -> *mut c_void {
        match &self.0[n] {
            CArg::P(value) => *value,
            _ => unreachable!("argument {n} marshalled as non-pointer"),
        }
    }
}

enum CRet {
    Void,
    I(i64),
    F(f64),
    B(bool),
    S(*const c_char),
    P(*mut c_void),
}

macro_rules! invoke_shape {
    ($ret:expr, $sym:expr, ($($ty:ty),*), ($($val:expr),*)) => {{
        match $ret {
            CType::Void => {
                let f: unsafe extern "C" fn($($ty),*) = std::mem::transmute($sym);
                f($($val),*);
                CRet::Void
            }
            CType::Bool => {
                let f: unsafe extern "C" fn($($ty),*) -> bool = std::mem::transmute($sym);
                CRet::B(f($($val),*))
            }
            CType::LongLong => {
                let f: unsafe extern "C" fn($($ty),*) -> i64 = std::mem::transmute($sym);
                CRet::I(f($($val),*))
            }
            CType::Double => {
                let f: unsafe extern "C" fn($($ty),*) -> f64 = std::mem::transmute($sym);
                CRet::F(f($($val),*))
            }
            CType::ConstCharPtr => {
                let f: unsafe extern "C" fn($($ty),*) -> *const c_char = std::mem::transmute($sym);
                CRet::S(f($($val),*))
            }
            CType::VoidPtr | CType::Table => {
                let f: unsafe extern "C" fn($($ty),*) -> *mut c_void = std::mem::transmute($sym);
                CRet::P(f($($val),*))
            }
        }
    }};
}

/// Calls `symbol` with the marshalled arguments.
///
/// # Safety
///
/// `symbol` must be a C function whose true type matches the shape and
/// return type being dispatched; the import path guarantees this to
/// the extent the declared signature is truthful.
unsafe fn call_symbol(
    ret: CType,
    symbol: *const (),
    shape: &str,
    args: &ArgPack,
) -> Result<CRet, AgentError> {
    let result = match shape {
        "" => invoke_shape!(ret, symbol, (), ()),
        "I" => invoke_shape!(ret, symbol, (i64), (args.i(0))),
        "II" => invoke_shape!(ret, symbol, (i64, i64), (args.i(0), args.i(1))),
        "III" => invoke_shape!(ret, symbol, (i64, i64, i64), (args.i(0), args.i(1), args.i(2))),
        "IIII" => invoke_shape!(
            ret,
            symbol,
            (i64, i64, i64, i64),
            (args.i(0), args.i(1), args.i(2), args.i(3))
        ),
        "F" => invoke_shape!(ret, symbol, (f64), (args.f(0))),
        "FF" => invoke_shape!(ret, symbol, (f64, f64), (args.f(0), args.f(1))),
        "FFF" => invoke_shape!(ret, symbol, (f64, f64, f64), (args.f(0), args.f(1), args.f(2))),
        "IF" => invoke_shape!(ret, symbol, (i64, f64), (args.i(0), args.f(1))),
        "FI" => invoke_shape!(ret, symbol, (f64, i64), (args.f(0), args.i(1))),
        "B" => invoke_shape!(ret, symbol, (bool), (args.b(0))),
        "IB" => invoke_shape!(ret, symbol, (i64, bool), (args.i(0), args.b(1))),
        "S" => invoke_shape!(ret, symbol, (*const c_char), (args.s(0))),
        "SS" => invoke_shape!(ret, symbol, (*const c_char, *const c_char), (args.s(0), args.s(1))),
        "SI" => invoke_shape!(ret, symbol, (*const c_char, i64), (args.s(0), args.i(1))),
        "IS" => invoke_shape!(ret, symbol, (i64, *const c_char), (args.i(0), args.s(1))),
        "P" => invoke_shape!(ret, symbol, (*mut c_void), (args.p(0))),
        "PI" => invoke_shape!(ret, symbol, (*mut c_void, i64), (args.p(0), args.i(1))),
        "PII" => invoke_shape!(
            ret,
            symbol,
            (*mut c_void, i64, i64),
            (args.p(0), args.i(1), args.i(2))
        ),
        "PP" => invoke_shape!(ret, symbol, (*mut c_void, *mut c_void), (args.p(0), args.p(1))),
        "PF" => invoke_shape!(ret, symbol, (*mut c_void, f64), (args.p(0), args.f(1))),
        "PS" => invoke_shape!(ret, symbol, (*mut c_void, *const c_char), (args.p(0), args.s(1))),
        _ => {
            return Err(AgentError::UnsupportedSignature(format!(
                "argument shape '{shape}' is not in the supported set"
            )))
        }
    };
    Ok(result)
}

fn marshal(
    function_name: &str,
    signature: &Signature,
    args: MultiValue,
) -> mlua::Result<(ArgPack, Vec<usize>)> {
    let supplied: Vec<LuaValue> = args.into_iter().collect();
    let mut pack = Vec::with_capacity(signature.params.len());
    let mut table_blobs = Vec::new();

    for (index, param) in signature.params.iter().enumerate() {
        let value = supplied.get(index).cloned().unwrap_or(LuaValue::Nil);
        let arg = match (*param, value) {
            (CType::LongLong, LuaValue::Integer(number)) => CArg::I(number),
            (CType::LongLong, LuaValue::Number(number)) => CArg::I(number as i64),
            (CType::Double, LuaValue::Number(number)) => CArg::F(number),
            (CType::Double, LuaValue::Integer(number)) => CArg::F(number as f64),
            (CType::Bool, LuaValue::Boolean(flag)) => CArg::B(flag),
            (CType::ConstCharPtr, LuaValue::String(text)) => {
                let text = text.to_string_lossy().to_string();
                CArg::S(CString::new(text).map_err(mlua::Error::external)?)
            }
            (CType::VoidPtr, LuaValue::LightUserData(pointer)) => CArg::P(pointer.0),
            (CType::VoidPtr, LuaValue::Integer(addr)) => CArg::P(addr as usize as *mut c_void),
            (CType::VoidPtr, LuaValue::Nil) => CArg::P(std::ptr::null_mut()),
            (CType::Table, LuaValue::Table(table)) => {
                let param_table = convert::lua_table_to_param(&table)?;
                let addr = managed::alloc_from(&codec::serialize(&param_table));
                table_blobs.push(addr);
                CArg::P(addr as *mut c_void)
            }
            (param, value) => {
                return Err(mlua::Error::RuntimeError(format!(
                    "{function_name}: argument {} must be {:?}, got {}",
                    index + 1,
                    param,
                    value.type_name()
                )))
            }
        };
        pack.push(arg);
    }
    Ok((ArgPack(pack), table_blobs))
}

fn push_return(lua: &Lua, ret_type: CType, result: CRet) -> mlua::Result<MultiValue> {
    let value = match result {
        CRet::Void => return Ok(MultiValue::new()),
        CRet::I(number) => LuaValue::Integer(number),
        CRet::F(number) => LuaValue::Number(number),
        CRet::B(flag) => LuaValue::Boolean(flag),
        CRet::S(text) => {
            if text.is_null() {
                LuaValue::Nil
            } else {
                let text = unsafe { CStr::from_ptr(text) }.to_string_lossy().to_string();
                LuaValue::String(lua.create_string(text)?)
            }
        }
        CRet::P(pointer) => {
            if ret_type == CType::Table {
                if pointer.is_null() {
                    LuaValue::Nil
                } else {
                    let addr = pointer as usize;
                    let table = unsafe { codec::deserialize_raw(pointer as *const u8) }
                        .map_err(mlua::Error::external)?;
                    if managed::is_known(addr) {
                        managed::release(addr);
                    }
                    LuaValue::Table(convert::param_table_to_lua(lua, &table)?)
                }
            } else {
                LuaValue::LightUserData(LightUserData(pointer))
            }
        }
    };
    Ok(MultiValue::from_vec(vec![value]))
}

/// Invokes a previously imported function on behalf of a script.
///
/// Arguments are popped from the script according to the import
/// signature, the native symbol is called, and the return value is
/// pushed back. Blob arguments minted for `table` parameters are
/// released afterwards; with a deallocation-delay guard active (the
/// dispatcher holds one around every script invocation) the backing
/// memory survives until the enclosing script function returns.
pub(crate) fn call_imported(
    lua: &Lua,
    function_name: &str,
    args: MultiValue,
) -> mlua::Result<MultiValue> {
    let imported = IMPORTS
        .with(|imports| imports.borrow().get(function_name).cloned())
        .ok_or_else(|| {
            mlua::Error::RuntimeError(format!(
                "'{function_name}' was called without a prior import(<library>, {function_name}, <signature>)"
            ))
        })?;

    trace!(
        function = function_name,
        library = %imported.library.path().display(),
        "calling imported native function"
    );

    let (pack, table_blobs) = marshal(function_name, &imported.signature, args)?;
    let shape = shape_of(&imported.signature.params);

    let result = unsafe { call_symbol(imported.signature.ret, imported.symbol, &shape, &pack) }
        .map_err(mlua::Error::external)?;

    for addr in table_blobs {
        managed::release(addr);
    }

    push_return(lua, imported.signature.ret, result)
}
