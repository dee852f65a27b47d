//! The prime counter: a small program used by the CLI and the tests.

use std::sync::Arc;

use crate::engine::{Args, DefinitionError, Program, Step};

pub const INITIAL_MESSAGE: &str = "Enter an integer, and I will tell you if it is a prime number.";

fn not_an_integer(input: &str) -> String {
    format!("Input {input} is not an integer.")
}

fn not_prime(number: i64) -> String {
    format!("Integer {number} is not a prime.")
}

fn is_prime(number: i64) -> String {
    format!("Integer {number} is a prime.")
}

fn summary(prime_count: i64) -> String {
    format!("{prime_count} prime number(s) received!")
}

fn check_prime() -> Result<Step<bool>, DefinitionError> {
    Step::builder("check_prime")
        .doc("Checks whether the input is a prime number.")
        .param::<i64>("x")
        .build(|_, args| async move {
            let x: i64 = args.get("x")?;
            if x <= 1 {
                return Ok(false);
            }
            Ok((2..).take_while(|&i| i <= x / i).all(|i| x % i != 0))
        })
}

fn convert_to_int() -> Result<Step<Option<i64>>, DefinitionError> {
    Step::builder("convert_to_int")
        .doc("Parses the given input to an integer.")
        .param::<String>("user_input")
        .build_sync(|_, args| {
            let input: String = args.get("user_input")?;
            Ok(input.trim().parse::<i64>().ok())
        })
}

/// A conversation that reports whether each entered integer is prime and
/// returns how many primes it saw.
pub fn prime_counter() -> Result<Program<i64>, DefinitionError> {
    let check_prime = check_prime()?;
    let convert_to_int = convert_to_int()?;

    let mut program = Program::unconfigured("prime-counter");
    program.register(&check_prime)?;
    program.register(&convert_to_int)?;

    let entry = Step::builder("entry")
        .doc(
            r#"
            A testing program that counts primes.

            - It requires you to enter an integer.
            - It will tell you whether it is a prime or not.
            - It will stop when encountering an exit phrase.

            Input: It accepts a custom exit phrase. Defaults to "End".
            Output: The number of prime numbers during the conversation.
            "#,
        )
        .param_or("end_phrase", "End".to_string())
        .build(move |cx, args| {
            let check_prime = check_prime.clone();
            let convert_to_int = convert_to_int.clone();
            async move {
                let end_phrase: String = args.get("end_phrase")?;
                let mut prime_count = 0;
                cx.post_assistant_reply(INITIAL_MESSAGE).await?;

                loop {
                    let input = cx.get_user_reply().await?;
                    if input == end_phrase {
                        break;
                    }
                    let Some(number) = convert_to_int
                        .call(&cx, Args::new().arg(&input))
                        .await?
                    else {
                        cx.post_assistant_reply(not_an_integer(&input)).await?;
                        continue;
                    };
                    if check_prime.call(&cx, Args::new().arg(number)).await? {
                        prime_count += 1;
                        cx.post_assistant_reply(is_prime(number)).await?;
                    } else {
                        cx.post_assistant_reply(not_prime(number)).await?;
                    }
                }

                cx.post_assistant_reply(summary(prime_count)).await?;
                Ok(prime_count)
            }
        })?;
    program.set_entry(entry)?;
    Ok(program)
}

/// [`prime_counter`] behind an `Arc`, as the executors take it.
pub fn shared_prime_counter() -> Result<Arc<Program<i64>>, DefinitionError> {
    prime_counter().map(Arc::new)
}
