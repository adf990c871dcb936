//! Basic usage of the `pinned_vec` crate:
//!
//! * Creating a vector.
//! * Appending and inserting items.
//! * Holding a pointer to an item across growth.

use pinned_vec::PinnedVec;

fn main() {
    let mut names = PinnedVec::new();

    names.push("Alice".to_string());
    names.push("Charlie".to_string());

    // Unlike Vec, growth never moves the elements, so this pointer stays
    // valid for as long as element 0 exists.
    let alice = std::ptr::from_ref(&names[0]);

    names.insert(1, "Bob".to_string());

    for i in 0..10_000 {
        names.push(format!("Guest {i}"));
    }

    println!(
        "vector grew to {} items with capacity {}",
        names.len(),
        names.capacity()
    );

    // SAFETY: Element 0 was never removed.
    println!("element 0 is still {:?} at {alice:p}", unsafe { &*alice });
}
