//! Macros for defining closed string vocabularies.

/// Defines a closed vocabulary of tokens persisted as plain strings.
///
/// This generates a fieldless enum with:
/// - `ALL`, every variant in declaration order
/// - `as_str()` returning the persisted token
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations that use the token
///
/// # Example
///
/// ```ignore
/// define_vocabulary! {
///     /// Reachability of a unit's agent.
///     AgentState {
///         Up => "Up",
///         Down => "Down",
///     }
/// }
///
/// let state: AgentState = "Up".parse()?;
/// ```
macro_rules! define_vocabulary {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $token:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every token of this vocabulary, in declaration order.
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),+ ];

            /// Returns the persisted token.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $token ),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $token => Ok($name::$variant), )+
                    other => Err($crate::error::ModelError::UnknownToken {
                        vocabulary: stringify!($name),
                        token: other.to_string(),
                    }),
                }
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}
