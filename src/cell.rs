//! The universal value type.
//!
//! A [`Cell`] is a cheap handle: cloning shares the underlying value, and
//! [`Cell::is`] compares identity. Small integers, small integral rationals,
//! statuses, short symbols and short strings are drawn from process-wide
//! pools so that equal values share identity. The pools are populated on
//! first use and never evicted.
//!
//! The empty list is a single pair whose head and tail are itself. It is
//! never mutated and is recognized by identity, never by structure.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, PoisonError, RwLock};

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{ToPrimitive, Zero};

use crate::Error;
use crate::closure::{Binding, Flavor};
use crate::conduit::Conduit;
use crate::continuation::Continuation;
use crate::handle;
use crate::number;
use crate::scope::Scope;
use crate::task::Task;

/// Smallest pooled integer.
pub const POOL_MIN: i64 = -256;
/// Largest pooled integer.
pub const POOL_MAX: i64 = 255;

/// Symbols and strings up to this many bytes are interned.
const SHORT: usize = 3;

#[derive(Clone)]
pub enum Cell {
    Boolean(bool),
    Integer(Arc<i64>),
    Float(Arc<f64>),
    Rational(Arc<BigRational>),
    Status(Arc<u8>),
    Symbol(Arc<str>),
    String(Arc<str>),
    Pair(Arc<Pair>),
    /// A scope seen from inside: private and public layers.
    Scope(Arc<Scope>),
    /// A scope seen from outside: public layer only.
    Object(Arc<Scope>),
    Binding(Arc<Binding>),
    Continuation(Arc<Continuation>),
    Task(Arc<Task>),
    Conduit(Arc<dyn Conduit>),
}

/// A mutable two-slot cell.
pub struct Pair {
    car: RwLock<Cell>,
    cdr: RwLock<Cell>,
}

static INTEGERS: LazyLock<Vec<Cell>> = LazyLock::new(|| {
    (POOL_MIN..=POOL_MAX)
        .map(|n| Cell::Integer(Arc::new(n)))
        .collect()
});

static RATIONALS: LazyLock<Vec<Cell>> = LazyLock::new(|| {
    (POOL_MIN..=POOL_MAX)
        .map(|n| Cell::Rational(Arc::new(BigRational::from_integer(BigInt::from(n)))))
        .collect()
});

static STATUSES: LazyLock<Vec<Cell>> =
    LazyLock::new(|| (0..=u8::MAX).map(|n| Cell::Status(Arc::new(n))).collect());

static SYMBOLS: LazyLock<Mutex<HashMap<Box<str>, Cell>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static STRINGS: LazyLock<Mutex<HashMap<Box<str>, Cell>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static NULL: LazyLock<Cell> = LazyLock::new(|| {
    let pair = Arc::new(Pair {
        car: RwLock::new(Cell::Boolean(false)),
        cdr: RwLock::new(Cell::Boolean(false)),
    });
    let null = Cell::Pair(pair.clone());
    *pair.car.write().unwrap_or_else(PoisonError::into_inner) = null.clone();
    *pair.cdr.write().unwrap_or_else(PoisonError::into_inner) = null.clone();
    null
});

fn intern(cache: &Mutex<HashMap<Box<str>, Cell>>, text: &str, make: fn(Arc<str>) -> Cell) -> Cell {
    if text.len() > SHORT {
        return make(Arc::from(text));
    }
    let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
    cache
        .entry(Box::from(text))
        .or_insert_with(|| make(Arc::from(text)))
        .clone()
}

fn pool_index(n: i64) -> Option<usize> {
    if (POOL_MIN..=POOL_MAX).contains(&n) {
        usize::try_from(n - POOL_MIN).ok()
    } else {
        None
    }
}

impl Cell {
    pub fn boolean(value: bool) -> Cell {
        Cell::Boolean(value)
    }

    pub fn integer(n: i64) -> Cell {
        match pool_index(n).and_then(|i| INTEGERS.get(i)) {
            Some(cell) => cell.clone(),
            None => Cell::Integer(Arc::new(n)),
        }
    }

    pub fn float(f: f64) -> Cell {
        Cell::Float(Arc::new(f))
    }

    /// The canonical form of an arithmetic result.
    pub fn rational(r: BigRational) -> Cell {
        if r.is_integer()
            && let Some(n) = r.to_integer().to_i64()
            && let Some(cell) = pool_index(n).and_then(|i| RATIONALS.get(i))
        {
            return cell.clone();
        }
        Cell::Rational(Arc::new(r))
    }

    pub fn status(n: u8) -> Cell {
        STATUSES[usize::from(n)].clone()
    }

    pub fn symbol(text: &str) -> Cell {
        intern(&SYMBOLS, text, Cell::Symbol)
    }

    pub fn string(text: &str) -> Cell {
        intern(&STRINGS, text, Cell::String)
    }

    pub fn null() -> Cell {
        NULL.clone()
    }

    pub fn cons(car: Cell, cdr: Cell) -> Cell {
        Cell::Pair(Arc::new(Pair {
            car: RwLock::new(car),
            cdr: RwLock::new(cdr),
        }))
    }

    /// Builds a proper list from `items`.
    pub fn list(items: impl IntoIterator<Item = Cell, IntoIter: DoubleEndedIterator>) -> Cell {
        items
            .into_iter()
            .rev()
            .fold(Cell::null(), |tail, head| Cell::cons(head, tail))
    }

    pub fn is_null(&self) -> bool {
        self.is(&NULL)
    }

    pub fn is_pair(&self) -> bool {
        matches!(self, Cell::Pair(_))
    }

    /// A pair that is not the empty list.
    pub fn is_cons(&self) -> bool {
        self.is_pair() && !self.is_null()
    }

    pub fn is_atom(&self) -> bool {
        matches!(
            self,
            Cell::Boolean(_)
                | Cell::Integer(_)
                | Cell::Float(_)
                | Cell::Rational(_)
                | Cell::Status(_)
                | Cell::Symbol(_)
                | Cell::String(_)
        )
    }

    /// Atoms and pairs may stand in for their symbol in argument lists;
    /// everything else is only substituted outside simple contexts.
    pub fn is_simple(&self) -> bool {
        self.is_atom() || self.is_pair()
    }

    /// Identity.
    pub fn is(&self, other: &Cell) -> bool {
        match (self, other) {
            (Cell::Boolean(a), Cell::Boolean(b)) => a == b,
            (Cell::Integer(a), Cell::Integer(b)) => Arc::ptr_eq(a, b),
            (Cell::Float(a), Cell::Float(b)) => Arc::ptr_eq(a, b),
            (Cell::Rational(a), Cell::Rational(b)) => Arc::ptr_eq(a, b),
            (Cell::Status(a), Cell::Status(b)) => Arc::ptr_eq(a, b),
            (Cell::Symbol(a), Cell::Symbol(b)) | (Cell::String(a), Cell::String(b)) => {
                Arc::ptr_eq(a, b)
            }
            (Cell::Pair(a), Cell::Pair(b)) => Arc::ptr_eq(a, b),
            (Cell::Scope(a), Cell::Scope(b)) | (Cell::Object(a), Cell::Object(b)) => {
                Arc::ptr_eq(a, b)
            }
            (Cell::Binding(a), Cell::Binding(b)) => Arc::ptr_eq(a, b),
            (Cell::Continuation(a), Cell::Continuation(b)) => Arc::ptr_eq(a, b),
            (Cell::Task(a), Cell::Task(b)) => Arc::ptr_eq(a, b),
            (Cell::Conduit(a), Cell::Conduit(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Cell::Boolean(b) => *b,
            Cell::Integer(n) => **n != 0,
            Cell::Float(f) => **f != 0.0,
            Cell::Rational(r) => !r.is_zero(),
            Cell::Status(n) => **n == 0,
            Cell::Symbol(s) | Cell::String(s) => !s.is_empty(),
            Cell::Pair(_) => !self.is_null(),
            _ => true,
        }
    }

    /// Structural equality. Numbers compare by rational value across
    /// variants, symbols and strings by text, pairs element-wise.
    pub fn equal(&self, other: &Cell) -> bool {
        let (mut a, mut b) = (self.clone(), other.clone());
        loop {
            if a.is(&b) {
                return true;
            }
            match (&a, &b) {
                (Cell::Pair(_), Cell::Pair(_)) => {
                    if a.is_null() || b.is_null() {
                        return false;
                    }
                    if !a.head().equal(&b.head()) {
                        return false;
                    }
                    (a, b) = (a.tail(), b.tail());
                }
                (Cell::Boolean(x), Cell::Boolean(y)) => return x == y,
                (Cell::Symbol(x) | Cell::String(x), _) => {
                    if !b.is_atom() || matches!(b, Cell::Boolean(_)) {
                        return false;
                    }
                    if matches!(a, Cell::Symbol(_))
                        && let (Some(p), Some(q)) =
                            (number::parse_rational(x), number::to_rational(&b))
                    {
                        return p == q;
                    }
                    return **x == *b.raw();
                }
                _ if a.is_atom() && !matches!(a, Cell::Boolean(_)) => {
                    return match (number::to_rational(&a), number::to_rational(&b)) {
                        (Some(x), Some(y)) => x == y,
                        _ => false,
                    };
                }
                _ => return false,
            }
        }
    }

    fn pair(&self) -> Result<&Pair, Error> {
        match self {
            Cell::Pair(pair) => Ok(pair),
            other => Err(Error::type_error(format!("expected pair, got {other}"))),
        }
    }

    pub fn car(&self) -> Result<Cell, Error> {
        Ok(self.pair()?.car.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    pub fn cdr(&self) -> Result<Cell, Error> {
        Ok(self.pair()?.cdr.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Head of a pair, or null for anything else.
    pub fn head(&self) -> Cell {
        self.car().unwrap_or_else(|_| Cell::null())
    }

    /// Tail of a pair, or null for anything else.
    pub fn tail(&self) -> Cell {
        self.cdr().unwrap_or_else(|_| Cell::null())
    }

    pub fn set_car(&self, value: Cell) -> Result<(), Error> {
        if self.is_null() {
            return Err(Error::runtime("can't modify the empty list"));
        }
        *self.pair()?.car.write().unwrap_or_else(PoisonError::into_inner) = value;
        Ok(())
    }

    pub fn set_cdr(&self, value: Cell) -> Result<(), Error> {
        if self.is_null() {
            return Err(Error::runtime("can't modify the empty list"));
        }
        *self.pair()?.cdr.write().unwrap_or_else(PoisonError::into_inner) = value;
        Ok(())
    }

    /// Elements of a list, stopping at null or at a non-pair tail.
    pub fn iter(&self) -> ListIter {
        ListIter { next: self.clone() }
    }

    pub fn to_vec(&self) -> Vec<Cell> {
        self.iter().collect()
    }

    pub fn length(&self) -> usize {
        self.iter().count()
    }

    pub fn reverse(&self) -> Cell {
        self.iter()
            .fold(Cell::null(), |tail, head| Cell::cons(head, tail))
    }

    /// Symbol name, if this is a symbol.
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Cell::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_symbol(&self, name: &str) -> bool {
        self.as_symbol() == Some(name)
    }

    pub fn as_task(&self) -> Result<&Arc<Task>, Error> {
        match self {
            Cell::Task(task) => Ok(task),
            other => Err(Error::type_error(format!("expected task, got {other}"))),
        }
    }

    pub fn as_conduit(&self) -> Result<&Arc<dyn Conduit>, Error> {
        match self {
            Cell::Conduit(conduit) => Ok(conduit),
            other => Err(Error::type_error(format!("expected conduit, got {other}"))),
        }
    }

    /// Text as passed to external commands: strings unquoted, everything
    /// else in canonical form.
    pub fn raw(&self) -> String {
        match self {
            Cell::String(s) => s.to_string(),
            other => other.to_string(),
        }
    }

    /// Tag used for opaque values in canonical text.
    pub fn tag(&self) -> &'static str {
        match self {
            Cell::Boolean(_) => "boolean",
            Cell::Integer(_) => "integer",
            Cell::Float(_) => "float",
            Cell::Rational(_) => "rational",
            Cell::Status(_) => "status",
            Cell::Symbol(_) => "symbol",
            Cell::String(_) => "string",
            Cell::Pair(_) => "pair",
            Cell::Scope(_) => "scope",
            Cell::Object(_) => "object",
            Cell::Binding(binding) => match binding.closure().flavor() {
                Flavor::Builtin => "builtin",
                Flavor::Method => "method",
                Flavor::Syntax => "syntax",
            },
            Cell::Continuation(_) => "continuation",
            Cell::Task(_) => "task",
            Cell::Conduit(_) => "conduit",
        }
    }
}

pub struct ListIter {
    next: Cell,
}

impl Iterator for ListIter {
    type Item = Cell;

    fn next(&mut self) -> Option<Cell> {
        if !self.next.is_cons() {
            return None;
        }
        let head = self.next.head();
        self.next = self.next.tail();
        Some(head)
    }
}

impl Drop for Pair {
    // Long lists are released iteratively instead of through nested drops.
    fn drop(&mut self) {
        let slot = self.cdr.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut next = std::mem::replace(slot, Cell::Boolean(false));
        while let Cell::Pair(pair) = next {
            match Arc::try_unwrap(pair) {
                Ok(mut pair) => {
                    let slot = pair.cdr.get_mut().unwrap_or_else(PoisonError::into_inner);
                    next = std::mem::replace(slot, Cell::Boolean(false));
                }
                Err(_) => break,
            }
        }
    }
}

fn write_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    write!(f, "\"")?;
    for ch in s.chars() {
        match ch {
            '"' => write!(f, "\\\"")?,
            '\\' => write!(f, "\\\\")?,
            '\n' => write!(f, "\\n")?,
            '\t' => write!(f, "\\t")?,
            '\r' => write!(f, "\\r")?,
            c => write!(f, "{c}")?,
        }
    }
    write!(f, "\"")
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Boolean(true) => write!(f, "#t"),
            Cell::Boolean(false) => write!(f, "#f"),
            Cell::Integer(n) => write!(f, "{n}"),
            Cell::Float(x) => write!(f, "{x}"),
            Cell::Rational(r) => {
                if r.is_integer() {
                    write!(f, "{}", r.numer())
                } else {
                    write!(f, "{}/{}", r.numer(), r.denom())
                }
            }
            Cell::Status(n) => write!(f, "{n}"),
            Cell::Symbol(s) => write!(f, "{s}"),
            Cell::String(s) => write_string(f, s),
            Cell::Pair(_) => {
                write!(f, "(")?;
                let mut cursor = self.clone();
                let mut first = true;
                while cursor.is_cons() {
                    if !first {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", cursor.head())?;
                    first = false;
                    cursor = cursor.tail();
                }
                if !cursor.is_pair() {
                    write!(f, " . {cursor}")?;
                }
                write!(f, ")")
            }
            opaque => match handle::token(opaque) {
                Some(token) => write!(f, "%{} {token}%", opaque.tag()),
                None => write!(f, "%{}%", opaque.tag()),
            },
        }
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::boolean(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::integer(value)
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::string(value)
    }
}

impl From<Vec<Cell>> for Cell {
    fn from(items: Vec<Cell>) -> Self {
        Cell::list(items)
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    fn sym(name: &str) -> Cell {
        Cell::symbol(name)
    }

    fn ratio(n: i64, d: i64) -> Cell {
        Cell::rational(BigRational::new(BigInt::from(n), BigInt::from(d)))
    }

    #[test]
    fn test_integer_pooling() {
        for n in [POOL_MIN, -1, 0, 1, 17, POOL_MAX] {
            for m in [POOL_MIN, -1, 0, 1, 17, POOL_MAX] {
                assert_eq!(Cell::integer(n).is(&Cell::integer(m)), n == m, "{n} vs {m}");
            }
        }
        assert!(!Cell::integer(POOL_MAX + 1).is(&Cell::integer(POOL_MAX + 1)));
        assert!(Cell::integer(POOL_MAX + 1).equal(&Cell::integer(POOL_MAX + 1)));
    }

    #[test]
    fn test_status_and_rational_pooling() {
        assert!(Cell::status(0).is(&Cell::status(0)));
        assert!(Cell::status(255).is(&Cell::status(255)));
        assert!(ratio(4, 2).is(&ratio(2, 1)));
        assert!(ratio(0, 5).is(&ratio(0, 1)));
        assert!(!ratio(1, 3).is(&ratio(1, 3)));
    }

    #[test]
    fn test_short_symbols_share_identity() {
        assert!(sym("ab").is(&sym("ab")));
        assert!(!sym("long-name").is(&sym("long-name")));
        assert!(sym("long-name").equal(&sym("long-name")));
        assert!(Cell::string("xy").is(&Cell::string("xy")));
    }

    #[test]
    fn test_cross_type_numeric_equality() {
        let cases = vec![
            (Cell::integer(7), ratio(14, 2), true),
            (Cell::status(3), Cell::integer(3), true),
            (ratio(1, 2), Cell::float(0.5), true),
            (Cell::integer(3), sym("3"), true),
            (sym("3"), Cell::integer(3), true),
            (sym("4/2"), Cell::integer(2), true),
            (Cell::integer(1), Cell::integer(2), false),
            (Cell::string("3"), Cell::integer(3), true),
            (Cell::string("a"), sym("a"), true),
            (Cell::boolean(true), Cell::integer(1), false),
            (Cell::integer(1), Cell::null(), false),
        ];
        for (i, (a, b, expected)) in cases.into_iter().enumerate() {
            assert_eq!(a.equal(&b), expected, "case #{}: {a} vs {b}", i + 1);
        }
    }

    #[test]
    fn test_null_sentinel() {
        let null = Cell::null();
        assert!(null.is_null());
        let mut cursor = null.clone();
        for _ in 0..10 {
            cursor = cursor.cdr().unwrap();
            assert!(cursor.is(&null));
            assert!(cursor.car().unwrap().is(&null));
        }
        assert!(null.set_car(sym("x")).is_err());
        assert!(null.set_cdr(sym("x")).is_err());
        assert!(null.is_pair());
        assert!(!null.is_cons());
    }

    #[test]
    fn test_cons_car_cdr() {
        let x = sym("x");
        let pair = Cell::cons(x.clone(), Cell::null());
        assert!(pair.car().unwrap().is(&x));
        assert!(pair.cdr().unwrap().is_null());
        assert!(sym("x").car().is_err());
        assert!(Cell::integer(1).cdr().is_err());

        pair.set_car(sym("y")).unwrap();
        assert!(pair.car().unwrap().is_symbol("y"));
    }

    #[test]
    fn test_reverse_twice_is_identity() {
        let lists = vec![
            Cell::null(),
            Cell::list(vec![sym("a")]),
            Cell::list(vec![sym("a"), Cell::integer(2), Cell::string("three")]),
            Cell::list(vec![Cell::list(vec![sym("x"), sym("y")]), Cell::null()]),
        ];
        for list in lists {
            assert!(list.reverse().reverse().equal(&list), "{list}");
        }
        let list = Cell::list(vec![sym("a"), sym("b"), sym("c")]);
        assert_eq!(list.reverse().to_string(), "(c b a)");
    }

    #[test]
    fn test_truthiness() {
        let cases = vec![
            (Cell::boolean(true), true),
            (Cell::boolean(false), false),
            (Cell::integer(0), false),
            (Cell::integer(-3), true),
            (Cell::status(0), true),
            (Cell::status(1), false),
            (ratio(0, 1), false),
            (Cell::string(""), false),
            (sym("x"), true),
            (Cell::null(), false),
            (Cell::list(vec![Cell::null()]), true),
        ];
        for (cell, expected) in cases {
            assert_eq!(cell.truthy(), expected, "{cell}");
        }
    }

    #[test]
    fn test_display() {
        let cases = vec![
            (Cell::boolean(true), "#t"),
            (ratio(3, 6), "1/2"),
            (ratio(-8, 2), "-4"),
            (Cell::string("a\"b\n"), "\"a\\\"b\\n\""),
            (Cell::null(), "()"),
            (Cell::cons(sym("a"), sym("b")), "(a . b)"),
            (
                Cell::list(vec![sym("a"), Cell::list(vec![Cell::integer(1)])]),
                "(a (1))",
            ),
        ];
        for (cell, expected) in cases {
            assert_eq!(cell.to_string(), expected);
        }
        assert_eq!(Cell::string("plain").raw(), "plain");
    }

    #[test]
    fn test_long_list_drop() {
        let mut list = Cell::null();
        for n in 0..200_000 {
            list = Cell::cons(Cell::integer(n), list);
        }
        assert_eq!(list.length(), 200_000);
        drop(list);
    }
}
