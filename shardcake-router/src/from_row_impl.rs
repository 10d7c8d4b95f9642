use crate::row::{FromRow, Row};
use crate::value::{FromValue, ValueError};

macro_rules! derive_tuple {
    ($($field:ident)*) => {
        impl<$($field: FromValue,)*> FromRow for ($($field,)*) {
            fn from_row(row: &Row) -> Result<Self, ValueError> {
                let mut columns = 0..;
                Ok((
                    $(
                        row.get::<$field>(columns.next().unwrap_or_default())?,
                    )*
                ))
            }
        }
    };
}

/// Implements [FromRow] for every tuple arity from 16 down to 1.
macro_rules! derive_common_tuples {
    () => {};
    ($first:ident $($rest:ident)*) => {
        derive_tuple!($first $($rest)*);
        derive_common_tuples!($($rest)*);
    };
}

derive_common_tuples!(T1 T2 T3 T4 T5 T6 T7 T8 T9 T10 T11 T12 T13 T14 T15 T16);
