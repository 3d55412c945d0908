/*
The tree never inspects the values it indexes: an object is an opaque,
application-supplied value with a byte serialization of known length, an
equality test and a stable 64-bit identifier. Anything satisfying this trait
and participating in a metric distance function can be stored.
*/

/// Application-supplied value stored in the tree.
pub trait Object: Clone {
    /// Stable identifier of the object, when the application has one.
    fn oid(&self) -> u64 {
        0
    }

    /// Exact length of the byte form produced by serialize.
    fn serialized_size(&self) -> usize;

    /// Byte form of the object. Must produce exactly serialized_size bytes,
    /// and unserialize of the result must reproduce the object.
    fn serialize(&self) -> Vec<u8>;

    /// Rebuilds the object from bytes previously produced by serialize.
    fn unserialize(bytes: &[u8]) -> Self;

    fn is_equal(&self, other: &Self) -> bool;
}
